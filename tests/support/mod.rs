//! A scripted framed channel shared by the integration suites.
//!
//! Plays the role of the external wire framer: frames go in and out fully
//! parsed, and a [`Handle`] lets the test feed the connection and inspect
//! what it wrote.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use estuary::channel::{Channel, ChannelInfo, SwitchChannel};
use estuary::proto::h1;
use estuary::ws;

pub fn channel<R, W>() -> (TestChannel<R, W>, Handle<R, W>) {
    let _ = pretty_env_logger::try_init();
    let state = Arc::new(Mutex::new(State {
        incoming: VecDeque::new(),
        read_closed: false,
        sent: Vec::new(),
        flushes: 0,
        shutdowns: 0,
        ws_installed: false,
        restores: 0,
        waker: None,
    }));
    (
        TestChannel {
            state: state.clone(),
            info: ChannelInfo::new(),
        },
        Handle { state },
    )
}

struct State<R, W> {
    incoming: VecDeque<estuary::Result<R>>,
    read_closed: bool,
    sent: Vec<W>,
    flushes: usize,
    shutdowns: usize,
    ws_installed: bool,
    restores: usize,
    waker: Option<Waker>,
}

pub struct TestChannel<R, W> {
    state: Arc<Mutex<State<R, W>>>,
    info: ChannelInfo,
}

pub struct Handle<R, W> {
    state: Arc<Mutex<State<R, W>>>,
}

impl<R, W> Handle<R, W> {
    fn lock(&self) -> MutexGuard<'_, State<R, W>> {
        self.state.lock().unwrap()
    }

    pub fn send_frame(&self, frame: R) {
        let mut state = self.lock();
        state.incoming.push_back(Ok(frame));
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn send_error(&self, err: estuary::Error) {
        let mut state = self.lock();
        state.incoming.push_back(Err(err));
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn close_read(&self) {
        let mut state = self.lock();
        state.read_closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Takes everything written so far.
    pub fn take_sent(&self) -> Vec<W> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Looks at everything written so far without consuming it.
    pub fn with_sent<T>(&self, f: impl FnOnce(&[W]) -> T) -> T {
        f(&self.lock().sent)
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    pub fn shutdowns(&self) -> usize {
        self.lock().shutdowns
    }

    pub fn ws_installed(&self) -> bool {
        self.lock().ws_installed
    }
}

impl<R, W> Channel for TestChannel<R, W> {
    type Recv = R;
    type Send = W;

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<estuary::Result<R>>> {
        let mut state = self.state.lock().unwrap();
        match state.incoming.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None if state.read_closed => Poll::Ready(None),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn send(&mut self, frame: W) {
        self.state.lock().unwrap().sent.push(frame);
    }

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.state.lock().unwrap().flushes += 1;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.state.lock().unwrap().shutdowns += 1;
        Poll::Ready(Ok(()))
    }

    fn info(&self) -> &ChannelInfo {
        &self.info
    }
}

impl SwitchChannel for TestChannel<h1::Frame, h1::OutFrame> {
    type Snapshot = ();

    fn snapshot(&mut self) -> Self::Snapshot {}

    fn install_web_socket(&mut self, _params: &ws::PipelineParams) {
        self.state.lock().unwrap().ws_installed = true;
    }

    fn restore(&mut self, _snapshot: Self::Snapshot) {
        let mut state = self.state.lock().unwrap();
        state.ws_installed = false;
        state.restores += 1;
    }
}
