//! The HTTP/1.x connection state machine.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use tokio::time::Sleep;

use crate::channel::{Certificate, Protocol, SwitchChannel};
use crate::config::ServerConfig;
use crate::exchange::{ExchangeMachine, Output};
use crate::proto::{ConnState, ResponseHead};
use crate::request::RequestHeaders;
use crate::service::Controller;
use crate::ws::{handshake, PipelineParams, Registration, Session};

use super::queue::ExchangeQueue;
use super::{Frame, OutFrame};

/// A server connection speaking pipelined HTTP/1.x over one channel.
///
/// The connection is a future: it resolves once the channel is fully shut
/// down, on every path. It owns the channel exclusively; all queue,
/// encoder and timer work happens inside `poll`, which is the event loop
/// the rest of the crate talks about.
pub struct Http1Connection<T, S>
where
    T: SwitchChannel<Recv = Frame, Send = OutFrame>,
    S: Controller,
{
    channel: T,
    controller: S,
    config: ServerConfig,
    queue: ExchangeQueue<S::Context>,
    state: ConnState,
    read_active: bool,
    pending_flush: bool,
    graceful_timer: Option<Pin<Box<Sleep>>>,
    idle_timer: Option<Pin<Box<Sleep>>>,
    ws: Option<Session>,
    ws_snapshot: Option<T::Snapshot>,
    error: Option<crate::Error>,
}

impl<T, S> Http1Connection<T, S>
where
    T: SwitchChannel<Recv = Frame, Send = OutFrame> + Unpin,
    T::Snapshot: Unpin,
    S: Controller + Unpin,
{
    /// Binds a connection to a channel and a controller.
    pub fn new(channel: T, controller: S, config: ServerConfig) -> Http1Connection<T, S> {
        Http1Connection {
            channel,
            controller,
            config,
            queue: ExchangeQueue::new(),
            state: ConnState::Open,
            read_active: false,
            pending_flush: false,
            graceful_timer: None,
            idle_timer: None,
            ws: None,
            ws_snapshot: None,
            error: None,
        }
    }

    /// Whether the channel below is TLS.
    pub fn is_tls(&self) -> bool {
        self.channel.info().is_tls()
    }

    /// The protocol this connection speaks.
    pub fn protocol(&self) -> Protocol {
        Protocol::Http11
    }

    /// The local address, when the transport has one.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.channel.info().local_addr()
    }

    /// The remote address, when the transport has one.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.channel.info().remote_addr()
    }

    /// Certificates presented by this side.
    pub fn local_certificates(&self) -> &[Certificate] {
        self.channel.info().local_certificates()
    }

    /// Certificates presented by the peer.
    pub fn remote_certificates(&self) -> &[Certificate] {
        self.channel.info().remote_certificates()
    }

    /// Whether the connection has fully closed.
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Shuts down immediately: every in-flight exchange is disposed with a
    /// "connection was closed" cause. Idempotent; awaiting the connection
    /// to completion observes the close.
    pub fn shutdown(self: Pin<&mut Self>) {
        let this = Pin::into_inner(self);
        if this.state == ConnState::Closed {
            return;
        }
        trace!("h1 shutdown");
        this.dispose_in_flight(true);
        this.state = ConnState::Closing;
        this.graceful_timer = None;
    }

    /// Shuts down gracefully: stops accepting requests and closes once
    /// in-flight exchanges drain, or forcibly after the configured
    /// timeout. Idempotent; calling while already closing just reports
    /// completion through the connection future.
    pub fn shutdown_gracefully(self: Pin<&mut Self>) {
        let this = Pin::into_inner(self);
        if this.state != ConnState::Open {
            return;
        }
        this.state = ConnState::Closing;
        if this.queue.is_empty() && this.ws.is_none() {
            trace!("graceful shutdown with nothing in flight");
            // an empty flush, then close
            this.pending_flush = true;
        } else {
            trace!(
                "graceful shutdown awaiting {} exchange(s)",
                this.queue.len()
            );
            this.graceful_timer = Some(Box::pin(tokio::time::sleep(
                this.config.graceful_shutdown_timeout,
            )));
        }
    }

    // ===== ingress =====

    fn poll_read(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        loop {
            if self.state == ConnState::Closed {
                return progress;
            }
            match self.channel.poll_recv(cx) {
                Poll::Pending => {
                    // framer batch boundary
                    self.read_active = false;
                    return progress;
                }
                Poll::Ready(None) => {
                    trace!("channel inactive");
                    self.read_active = false;
                    if !self.queue.is_empty() {
                        self.dispose_in_flight(true);
                    } else if let Some(ref mut session) = self.ws {
                        let mut out = Vec::new();
                        session.cancel(true, &mut out);
                        self.ws = None;
                    }
                    if self.state == ConnState::Open {
                        self.state = ConnState::Closing;
                    }
                    return true;
                }
                Poll::Ready(Some(Ok(frame))) => {
                    self.read_active = true;
                    progress = true;
                    self.on_frame(frame);
                }
                Poll::Ready(Some(Err(err))) => {
                    self.read_active = false;
                    self.on_read_error(err);
                    return true;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Start(start) => {
                if self.state != ConnState::Open {
                    debug!("dropping request received while closing");
                    return;
                }
                if self.ws.is_some() {
                    debug!("dropping http request on upgraded channel");
                    return;
                }
                match start.version {
                    http::Version::HTTP_10 | http::Version::HTTP_11 => {}
                    version => {
                        debug!("unsupported version {:?}", version);
                        let err = crate::Error::new_version();
                        self.synthesize_error_response(&err);
                        self.exception_caught(err);
                        return;
                    }
                }
                let head = RequestHeaders::new(
                    start.method,
                    start.target,
                    start.version,
                    start.headers,
                    self.channel.info().is_tls(),
                );
                if self.config.http1x_validate_headers
                    && head.version() == http::Version::HTTP_11
                    && head.authority().is_none()
                {
                    let err = crate::Error::new_missing_host();
                    self.synthesize_error_response(&err);
                    self.exception_caught(err);
                    return;
                }
                if head.expects_continue() {
                    self.write_frame(OutFrame::Continue);
                }
                self.idle_timer = None;
                trace!("incoming request: {} {}", head.method(), head.path());
                let machine = ExchangeMachine::new(
                    &self.controller,
                    head,
                    Protocol::Http11,
                    self.config.ws_enabled,
                    false,
                );
                if self.queue.push(machine) {
                    if let Some(front) = self.queue.responding_mut() {
                        front.start(&self.controller);
                    }
                }
            }
            Frame::Chunk(chunk) => match self.queue.requesting_mut() {
                Some(machine) if !machine.is_disposed() => {
                    // the outcome only matters for flow-controlled
                    // protocols; rejected chunks are simply released
                    let _ = machine.recv_chunk(chunk);
                }
                _ => {
                    trace!("releasing body chunk with no requesting exchange");
                }
            },
            Frame::End(trailers) => {
                if let Some(machine) = self.queue.requesting_mut() {
                    machine.recv_end(trailers);
                }
            }
            Frame::Ws(frame) => {
                let session = match self.ws {
                    Some(ref mut session) => session,
                    None => {
                        debug!("websocket frame with no session");
                        return;
                    }
                };
                let mut out = Vec::new();
                let result = session.on_frame(frame, &mut out);
                let closed = session.is_closed();
                for frame in out {
                    self.write_frame(OutFrame::Ws(frame));
                }
                if let Err(err) = result {
                    // delegated to the websocket layer: the close frame is
                    // on its way out, the close timer bounds the rest
                    debug!("websocket framing error: {}", err);
                }
                if closed {
                    self.ws = None;
                    self.state = ConnState::Closing;
                }
            }
        }
    }

    fn on_read_error(&mut self, err: crate::Error) {
        if err.is_ws() {
            if let Some(ref mut session) = self.ws {
                let mut out = Vec::new();
                session.cancel(true, &mut out);
                for frame in out {
                    self.write_frame(OutFrame::Ws(frame));
                }
                return;
            }
        }
        debug!("read error: {}", err);
        if err.is_parse() && self.queue.is_empty() && self.state == ConnState::Open {
            // a minimal response can still go out in front of the close
            self.synthesize_error_response(&err);
        }
        self.exception_caught(err);
    }

    /// A minimal synthesized response for a request that never became an
    /// exchange.
    fn synthesize_error_response(&mut self, err: &crate::Error) {
        let status = err.synthesized_status();
        debug!("synthesizing {} response", status);
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        self.write_frame(OutFrame::Head(ResponseHead { status, headers }));
        self.write_frame(OutFrame::End(None));
    }

    // ===== egress =====

    fn poll_write(&mut self, cx: &mut Context<'_>) -> bool {
        if self.ws.is_some() {
            return self.poll_ws(cx);
        }
        let mut progress = false;
        loop {
            if self.state == ConnState::Closed {
                return progress;
            }
            let polled = match self.queue.responding_mut() {
                Some(machine) => {
                    if !machine.is_started() {
                        machine.start(&self.controller);
                    }
                    machine.poll_output(cx, &self.controller)
                }
                None => break,
            };
            match polled {
                Poll::Pending => break,
                Poll::Ready(Ok(Some(output))) => {
                    progress = true;
                    self.on_output(output);
                }
                Poll::Ready(Ok(None)) => {
                    progress = true;
                    self.on_exchange_complete();
                }
                Poll::Ready(Err(err)) => {
                    progress = true;
                    self.on_exchange_error(err);
                    break;
                }
            }
        }
        progress
    }

    fn on_output(&mut self, output: Output) {
        match output {
            Output::Head { head, end } => {
                self.write_frame(OutFrame::Head(head));
                if end {
                    self.write_frame(OutFrame::End(None));
                }
            }
            Output::Data(chunk) => {
                self.write_frame(OutFrame::Chunk(chunk));
            }
            Output::End(trailers) => {
                self.write_frame(OutFrame::End(trailers));
            }
            Output::Upgrade(registration) => {
                self.begin_upgrade(registration);
            }
            Output::Push(_) => {
                debug_assert!(false, "server push on an HTTP/1.x exchange");
            }
        }
    }

    fn on_exchange_complete(&mut self) {
        let mut machine = match self.queue.pop_responding() {
            Some(machine) => machine,
            None => return,
        };
        trace!("exchange complete, keep_alive={}", machine.keep_alive());
        machine.dispose(None);

        if machine.keep_alive() {
            if let Some(next) = self.queue.responding_mut() {
                next.start(&self.controller);
            } else {
                // drained: release any graceful waiter, or go idle
                if self.state == ConnState::Closing {
                    self.graceful_timer = None;
                } else if let Some(idle) = self.config.idle_timeout {
                    self.idle_timer = Some(Box::pin(tokio::time::sleep(idle)));
                }
            }
        } else {
            self.dispose_in_flight(true);
            if self.state == ConnState::Open {
                self.state = ConnState::Closing;
            }
        }
    }

    fn on_exchange_error(&mut self, err: crate::Error) {
        debug!("exchange error: {}", err);
        if let Some(mut machine) = self.queue.pop_responding() {
            machine.dispose(Some(crate::Error::new_connection_closed()));
        }
        self.exception_caught(err);
    }

    // ===== websocket =====

    fn begin_upgrade(&mut self, registration: Registration) {
        let head = match self.queue.responding_mut() {
            Some(machine) => machine.head().clone(),
            None => return,
        };
        match handshake::negotiate(&head, &registration.subprotocols, &self.config) {
            Ok(hs) => {
                trace!("ws handshake accepted");
                self.ws_snapshot = Some(self.channel.snapshot());
                let params = PipelineParams {
                    max_frame_size: self.config.ws_max_frame_size,
                    allow_mask_mismatch: self.config.ws_allow_mask_mismatch,
                    handshake_timeout: self.config.ws_handshake_timeout,
                    deflate: hs.deflate.clone(),
                };
                self.channel.install_web_socket(&params);

                let mut headers = HeaderMap::new();
                headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
                headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
                headers.insert(header::SEC_WEBSOCKET_ACCEPT, hs.accept.clone());
                if let Some(ref subprotocol) = hs.subprotocol {
                    if let Ok(value) = HeaderValue::from_str(subprotocol) {
                        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                    }
                }
                if let Some(ref extensions) = hs.extensions {
                    headers.insert(header::SEC_WEBSOCKET_EXTENSIONS, extensions.clone());
                }
                self.write_frame(OutFrame::Head(ResponseHead {
                    status: StatusCode::SWITCHING_PROTOCOLS,
                    headers,
                }));

                // the http exchange ends here, body never sent
                if let Some(mut machine) = self.queue.pop_responding() {
                    machine.dispose(None);
                }
                self.queue.dispose_all(crate::Error::new_connection_closed);

                self.ws = Some(Session::open(
                    registration.handler,
                    hs.subprotocol,
                    self.config.ws_max_frame_size,
                    self.config.ws_allow_mask_mismatch,
                    self.config.ws_close_timeout,
                ));
            }
            Err(err) => {
                warn!("ws handshake failed: {}", err);
                if let Some(snapshot) = self.ws_snapshot.take() {
                    self.channel.restore(snapshot);
                }
                let controller = &self.controller;
                if let Some(machine) = self.queue.responding_mut() {
                    match registration.fallback {
                        Some(fallback) => machine.apply_ws_fallback(fallback),
                        None => {
                            if machine.handle_error(err, controller).is_err() {
                                let fatal = crate::Error::new_ws_handshake();
                                self.on_exchange_error(fatal);
                            }
                        }
                    }
                }
            }
        }
    }

    fn poll_ws(&mut self, cx: &mut Context<'_>) -> bool {
        let session = match self.ws {
            Some(ref mut session) => session,
            None => return false,
        };
        let mut out = Vec::new();
        let polled = session.poll(cx, &mut out);
        let progress = !out.is_empty() || polled.is_ready();
        for frame in out {
            self.write_frame(OutFrame::Ws(frame));
        }
        match polled {
            Poll::Pending => {}
            Poll::Ready(Ok(())) => {
                trace!("ws session closed");
                self.ws = None;
                self.state = ConnState::Closing;
            }
            Poll::Ready(Err(err)) => {
                debug!("ws session failed: {}", err);
                self.ws = None;
                self.exception_caught(err);
            }
        }
        progress
    }

    // ===== shutdown =====

    /// Buffer-writes a frame. The flush is coalesced: while a read batch
    /// is being drained nothing is flushed, and `poll` flushes exactly
    /// once when the batch ends.
    fn write_frame(&mut self, frame: OutFrame) {
        self.channel.send(frame);
        self.pending_flush = true;
    }

    fn dispose_in_flight(&mut self, with_cause: bool) {
        self.queue.dispose_all(crate::Error::new_connection_closed);
        if let Some(ref mut session) = self.ws {
            let mut out = Vec::new();
            session.cancel(with_cause, &mut out);
            for frame in out {
                self.channel.send(OutFrame::Ws(frame));
            }
            self.pending_flush = true;
        }
        self.ws = None;
    }

    fn exception_caught(&mut self, err: crate::Error) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.dispose_in_flight(true);
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
        }
        self.graceful_timer = None;
    }

    fn ready_to_close(&self) -> bool {
        self.state == ConnState::Closing && self.queue.is_empty() && self.ws.is_none()
    }

    fn poll_timers(&mut self, cx: &mut Context<'_>) {
        if let Some(ref mut timer) = self.graceful_timer {
            if timer.as_mut().poll(cx).is_ready() {
                debug!("graceful shutdown timed out, closing forcibly");
                self.graceful_timer = None;
                self.dispose_in_flight(true);
            }
        }
        if let Some(ref mut timer) = self.idle_timer {
            if timer.as_mut().poll(cx).is_ready() {
                trace!("idle timeout");
                self.idle_timer = None;
                if self.state == ConnState::Open && self.queue.is_empty() {
                    self.state = ConnState::Closing;
                }
            }
        }
    }
}

impl<T, S> Future for Http1Connection<T, S>
where
    T: SwitchChannel<Recv = Frame, Send = OutFrame> + Unpin,
    T::Snapshot: Unpin,
    S: Controller + Unpin,
{
    type Output = crate::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        loop {
            if this.state == ConnState::Closed {
                return Poll::Ready(match this.error.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                });
            }

            let read_progress = this.poll_read(cx);
            let write_progress = this.poll_write(cx);
            this.poll_timers(cx);

            if this.pending_flush && !this.read_active {
                match this.channel.poll_flush(cx) {
                    Poll::Ready(Ok(())) => this.pending_flush = false,
                    Poll::Ready(Err(err)) => {
                        this.exception_caught(crate::Error::new_io(err));
                    }
                    Poll::Pending => {}
                }
            }

            if this.ready_to_close() && !this.pending_flush {
                match this.channel.poll_shutdown(cx) {
                    Poll::Ready(Ok(())) => {
                        trace!("channel shut down");
                        this.state = ConnState::Closed;
                        continue;
                    }
                    Poll::Ready(Err(err)) => {
                        this.state = ConnState::Closed;
                        if this.error.is_none() {
                            this.error = Some(crate::Error::new_shutdown(err));
                        }
                        continue;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            if !read_progress && !write_progress {
                return Poll::Pending;
            }
        }
    }
}

impl<T, S> fmt::Debug for Http1Connection<T, S>
where
    T: SwitchChannel<Recv = Frame, Send = OutFrame>,
    S: Controller,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http1Connection")
            .field("state", &self.state)
            .field("queue", &self.queue)
            .field("ws", &self.ws.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use crate::proto::h1::RequestStart;
    use crate::service::controller_fn;
    use futures_util::task::noop_waker_ref;
    use http::{Method, Uri, Version};
    use matches::assert_matches;

    type TestConn<S> = Http1Connection<MockChannel<Frame, OutFrame>, S>;

    fn cx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    fn get(path: &str) -> Frame {
        request(Method::GET, path, &[("host", "test")])
    }

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> Frame {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(
                header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        Frame::Start(RequestStart {
            method,
            target: path.parse::<Uri>().unwrap(),
            version: Version::HTTP_11,
            headers: map,
        })
    }

    fn echo_path_controller() -> impl Controller<Context = ()> {
        controller_fn(|mut exchange| async move {
            let path = exchange.request().headers().path().to_owned();
            let label = path.trim_start_matches('/').to_uppercase();
            exchange.response().body().string(label);
            Ok(())
        })
    }

    fn statuses(sent: &[OutFrame]) -> Vec<StatusCode> {
        sent.iter()
            .filter_map(|f| match f {
                OutFrame::Head(head) => Some(head.status),
                _ => None,
            })
            .collect()
    }

    fn chunks(sent: &[OutFrame]) -> Vec<bytes::Bytes> {
        sent.iter()
            .filter_map(|f| match f {
                OutFrame::Chunk(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn pipelined_responses_in_request_order() {
        let mut channel = MockChannel::new();
        channel.push_frame(get("/a"));
        channel.push_frame(Frame::End(None));
        channel.push_frame(get("/b"));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        let sent = &conn.channel.sent;
        assert_eq!(statuses(sent), vec![StatusCode::OK, StatusCode::OK]);
        assert_eq!(chunks(sent), vec!["A", "B"]);
        // the first response is fully written before the second starts
        let a = sent
            .iter()
            .position(|f| matches!(f, OutFrame::Chunk(c) if c == "A"))
            .unwrap();
        let first_end = sent
            .iter()
            .position(|f| matches!(f, OutFrame::End(_)))
            .unwrap();
        let b_head = sent
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f, OutFrame::Head(_)))
            .nth(1)
            .unwrap()
            .0;
        assert!(a < first_end && first_end < b_head);
        // keep-alive: still open
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn uri_too_long_gets_a_minimal_response_and_closes() {
        let mut channel = MockChannel::new();
        channel.push_error(crate::Error::new_uri_too_long());

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        let result = match Pin::new(&mut conn).poll(&mut cx()) {
            Poll::Ready(result) => result,
            Poll::Pending => panic!("connection should close"),
        };
        assert!(result.unwrap_err().is_parse());
        assert_eq!(statuses(&conn.channel.sent), vec![StatusCode::URI_TOO_LONG]);
        assert_eq!(conn.channel.shutdowns, 1);
    }

    #[tokio::test]
    async fn handler_error_keeps_the_connection_open() {
        let controller = controller_fn(|exchange| async move {
            let _ = exchange;
            Err(crate::HttpError::not_found().into())
        });
        let mut channel = MockChannel::new();
        channel.push_frame(get("/missing"));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, controller, ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        assert_eq!(statuses(&conn.channel.sent), vec![StatusCode::NOT_FOUND]);
        assert!(chunks(&conn.channel.sent).is_empty());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn connection_close_disposes_and_shuts_down() {
        let mut channel = MockChannel::new();
        channel.push_frame(request(Method::GET, "/a", &[("connection", "close")]));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        match Pin::new(&mut conn).poll(&mut cx()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("connection should close"),
        }
        assert_eq!(statuses(&conn.channel.sent), vec![StatusCode::OK]);
        assert_eq!(conn.channel.shutdowns, 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn head_suppresses_the_body() {
        let mut channel = MockChannel::new();
        channel.push_frame(request(Method::HEAD, "/a", &[("host", "test")]));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        let sent = &conn.channel.sent;
        assert_eq!(statuses(sent), vec![StatusCode::OK]);
        assert!(chunks(sent).is_empty());
        // content-length still advertises the suppressed body
        let head = sent
            .iter()
            .find_map(|f| match f {
                OutFrame::Head(head) => Some(head),
                _ => None,
            })
            .unwrap();
        assert_eq!(head.headers.get(header::CONTENT_LENGTH).unwrap(), "1");
    }

    #[tokio::test]
    async fn expect_continue_is_answered() {
        let mut channel = MockChannel::new();
        channel.push_frame(request(
            Method::POST,
            "/upload",
            &[("host", "test"), ("expect", "100-continue")],
        ));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());
        assert_matches!(conn.channel.sent[0], OutFrame::Continue);
    }

    #[tokio::test]
    async fn graceful_shutdown_with_empty_queue_closes_immediately() {
        let channel = MockChannel::new();
        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        Pin::new(&mut conn).shutdown_gracefully();
        match Pin::new(&mut conn).poll(&mut cx()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("nothing in flight, should close now"),
        }
        assert!(conn.is_closed());
        assert_eq!(conn.channel.shutdowns, 1);
    }

    #[tokio::test]
    async fn requests_are_dropped_while_closing() {
        let channel = MockChannel::new();
        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        Pin::new(&mut conn).shutdown_gracefully();
        conn.channel.push_frame(get("/late"));
        let _ = Pin::new(&mut conn).poll(&mut cx());
        assert!(statuses(&conn.channel.sent).is_empty());
    }

    #[tokio::test]
    async fn flushes_coalesce_to_one_per_batch() {
        let mut channel = MockChannel::new();
        channel.push_frame(get("/a"));
        channel.push_frame(Frame::End(None));
        channel.push_frame(get("/b"));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        // two full responses, one flush for the whole read batch
        assert_eq!(statuses(&conn.channel.sent).len(), 2);
        assert_eq!(conn.channel.flushes, 1);
    }

    #[tokio::test]
    async fn web_socket_upgrade_switches_the_pipeline() {
        let controller = controller_fn(|mut exchange| async move {
            exchange.web_socket(vec!["chat"], |_ws| {
                Box::pin(futures_util::future::pending())
                    as crate::service::Completion
            })?;
            Ok(())
        });
        let mut channel = MockChannel::new();
        channel.push_frame(request(
            Method::GET,
            "/chat",
            &[
                ("host", "test"),
                ("upgrade", "websocket"),
                ("connection", "Upgrade"),
                ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
                ("sec-websocket-version", "13"),
            ],
        ));
        channel.push_frame(Frame::End(None));

        let mut conn: TestConn<_> =
            Http1Connection::new(channel, controller, ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        assert!(conn.channel.ws_installed);
        assert_eq!(
            statuses(&conn.channel.sent),
            vec![StatusCode::SWITCHING_PROTOCOLS]
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let channel = MockChannel::new();
        let mut conn: TestConn<_> =
            Http1Connection::new(channel, echo_path_controller(), ServerConfig::default());
        Pin::new(&mut conn).shutdown();
        Pin::new(&mut conn).shutdown();
        match Pin::new(&mut conn).poll(&mut cx()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("should close"),
        }
        assert_eq!(conn.channel.shutdowns, 1);
        Pin::new(&mut conn).shutdown();
        assert_eq!(conn.channel.shutdowns, 1);
    }
}
