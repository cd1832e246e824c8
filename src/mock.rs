//! A scripted channel for unit tests.

use std::collections::VecDeque;
use std::io;
use std::task::{Context, Poll};

use crate::channel::{Channel, ChannelInfo, SwitchChannel};
use crate::proto::h1;
use crate::ws;

/// A channel fed from a script of inbound frames, recording everything
/// sent. When the script runs dry it reports `Pending`, or end-of-stream
/// after `close_read`.
pub(crate) struct MockChannel<R, W> {
    incoming: VecDeque<crate::Result<R>>,
    read_closed: bool,
    pub(crate) sent: Vec<W>,
    pub(crate) flushes: usize,
    pub(crate) shutdowns: usize,
    pub(crate) ws_installed: bool,
    info: ChannelInfo,
}

impl<R, W> MockChannel<R, W> {
    pub(crate) fn new() -> MockChannel<R, W> {
        MockChannel {
            incoming: VecDeque::new(),
            read_closed: false,
            sent: Vec::new(),
            flushes: 0,
            shutdowns: 0,
            ws_installed: false,
            info: ChannelInfo::new(),
        }
    }

    pub(crate) fn push_frame(&mut self, frame: R) {
        self.incoming.push_back(Ok(frame));
    }

    pub(crate) fn push_error(&mut self, err: crate::Error) {
        self.incoming.push_back(Err(err));
    }

    /// After the script, report the peer closed the read side.
    pub(crate) fn close_read(&mut self) {
        self.read_closed = true;
    }
}

impl<R, W> Channel for MockChannel<R, W> {
    type Recv = R;
    type Send = W;

    fn poll_recv(&mut self, _cx: &mut Context<'_>) -> Poll<Option<crate::Result<R>>> {
        match self.incoming.pop_front() {
            Some(item) => Poll::Ready(Some(item)),
            None if self.read_closed => Poll::Ready(None),
            None => Poll::Pending,
        }
    }

    fn send(&mut self, frame: W) {
        self.sent.push(frame);
    }

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flushes += 1;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(&mut self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns += 1;
        Poll::Ready(Ok(()))
    }

    fn info(&self) -> &ChannelInfo {
        &self.info
    }
}

impl SwitchChannel for MockChannel<h1::Frame, h1::OutFrame> {
    type Snapshot = ();

    fn snapshot(&mut self) {}

    fn install_web_socket(&mut self, _params: &ws::PipelineParams) {
        self.ws_installed = true;
    }

    fn restore(&mut self, _snapshot: ()) {
        self.ws_installed = false;
    }
}
