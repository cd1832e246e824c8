//! The HTTP/2 connection state machine.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::time::Sleep;

use crate::channel::{Certificate, Channel, Protocol};
use crate::config::ServerConfig;
use crate::exchange::{ChunkOutcome, ExchangeMachine, Output};
use crate::proto::ConnState;
use crate::request::RequestHeaders;
use crate::service::Controller;

use super::frame::{
    DataFrame, Frame, HeadersFrame, PushPromiseFrame, PushRequest, Reason, Settings, StreamId,
};
use super::flow::FlowControl;
use super::stream::{StreamEntry, StreamTable};

/// A server connection multiplexing HTTP/2 streams over one channel.
///
/// Each open stream owns one exchange. All writes are serialized through
/// this future's `poll` — the connection event loop; anything user code
/// does crosses back in through the exchange channels.
pub struct Http2Connection<T, S>
where
    T: Channel<Recv = Frame, Send = Frame>,
    S: Controller,
{
    channel: T,
    controller: S,
    config: ServerConfig,
    streams: StreamTable<S::Context>,
    state: ConnState,
    read_active: bool,
    pending_flush: bool,
    send_flow: FlowControl,
    recv_flow: FlowControl,
    local_settings: Settings,
    remote_settings: Settings,
    next_promise_id: StreamId,
    goaway_sent: bool,
    graceful_timer: Option<Pin<Box<Sleep>>>,
    idle_timer: Option<Pin<Box<Sleep>>>,
    error: Option<crate::Error>,
}

impl<T, S> Http2Connection<T, S>
where
    T: Channel<Recv = Frame, Send = Frame> + Unpin,
    S: Controller + Unpin,
{
    /// Binds a connection to a channel and a controller. The connection
    /// preface and settings exchange are the framer's concern; the first
    /// inbound `Settings` frame updates the peer view here.
    pub fn new(channel: T, controller: S, config: ServerConfig) -> Http2Connection<T, S> {
        let local_settings = Settings::default();
        let remote_settings = Settings::default();
        Http2Connection {
            channel,
            controller,
            config,
            streams: StreamTable::new(),
            state: ConnState::Open,
            read_active: false,
            pending_flush: false,
            send_flow: FlowControl::new(remote_settings.initial_window_size),
            recv_flow: FlowControl::new(local_settings.initial_window_size),
            local_settings,
            remote_settings,
            next_promise_id: 2,
            goaway_sent: false,
            graceful_timer: None,
            idle_timer: None,
            error: None,
        }
    }

    /// Whether the channel below is TLS.
    pub fn is_tls(&self) -> bool {
        self.channel.info().is_tls()
    }

    /// The protocol this connection speaks.
    pub fn protocol(&self) -> Protocol {
        Protocol::Http2
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

    /// Shuts down immediately: GOAWAY, every stream disposed with a
    /// "connection was closed" cause. Idempotent.
    pub fn shutdown(self: Pin<&mut Self>) {
        let this = Pin::into_inner(self);
        if this.state == ConnState::Closed {
            return;
        }
        trace!("h2 shutdown");
        this.send_goaway(Reason::NO_ERROR);
        this.streams.dispose_all(crate::Error::new_connection_closed);
        this.state = ConnState::Closing;
        this.graceful_timer = None;
    }

    /// Shuts down gracefully: GOAWAY, current streams run to completion,
    /// then close — forcibly after the configured timeout.
    pub fn shutdown_gracefully(self: Pin<&mut Self>) {
        let this = Pin::into_inner(self);
        if this.state != ConnState::Open {
            return;
        }
        this.send_goaway(Reason::NO_ERROR);
        this.state = ConnState::Closing;
        if this.streams.is_empty() {
            trace!("graceful shutdown with no open streams");
            this.pending_flush = true;
        } else {
            trace!("graceful shutdown awaiting {} stream(s)", this.streams.len());
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
                    self.read_active = false;
                    return progress;
                }
                Poll::Ready(None) => {
                    trace!("channel inactive");
                    self.read_active = false;
                    if !self.streams.is_empty() {
                        self.streams.dispose_all(crate::Error::new_connection_closed);
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
                    debug!("read error: {}", err);
                    self.fatal(err, Reason::PROTOCOL_ERROR);
                    return true;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Headers(headers) => self.on_headers(headers),
            Frame::Data(data) => self.on_data(data),
            Frame::Reset { stream_id, reason } => {
                debug!("stream {} reset by peer: {}", stream_id, reason);
                if let Some(mut entry) = self.streams.remove(stream_id) {
                    entry.machine.reset(reason);
                }
                self.maybe_drained();
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                if self.send_flow.release(increment).is_err() {
                    self.fatal(crate::Error::new_flow_control(), Reason::FLOW_CONTROL_ERROR);
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let overflowed = match self.streams.get_mut(stream_id) {
                    Some(entry) => entry.send_flow.release(increment).is_err(),
                    None => false,
                };
                if overflowed {
                    self.reset_stream(stream_id, Reason::FLOW_CONTROL_ERROR);
                }
            }
            Frame::Priority {
                stream_id,
                dependency,
            } => {
                trace!(
                    "stream {} priority: depends on {} weight {}",
                    stream_id,
                    dependency.dependency_id,
                    dependency.weight
                );
            }
            Frame::Settings { ack: true, .. } => {
                trace!("settings acknowledged");
            }
            Frame::Settings { ack: false, settings } => {
                let delta = i64::from(settings.initial_window_size)
                    - i64::from(self.remote_settings.initial_window_size);
                if delta != 0 {
                    self.streams.resize_send_windows(delta);
                }
                self.remote_settings = settings;
                self.channel.send(Frame::Settings {
                    ack: true,
                    settings: self.local_settings,
                });
                self.pending_flush = true;
            }
            Frame::Ping { ack: true, .. } => {
                trace!("ping acknowledged");
            }
            Frame::Ping {
                ack: false,
                payload,
            } => {
                self.channel.send(Frame::Ping { ack: true, payload });
                self.pending_flush = true;
            }
            Frame::GoAway {
                last_stream_id,
                reason,
            } => {
                debug!("goaway from peer: {} last_stream={}", reason, last_stream_id);
                if self.state == ConnState::Open {
                    self.state = ConnState::Closing;
                }
                self.maybe_drained();
            }
            Frame::PushPromise(promise) => {
                debug!("push promise from a client, stream {}", promise.stream_id);
                self.fatal(crate::Error::new_unexpected_message(), Reason::PROTOCOL_ERROR);
            }
            Frame::Opaque { stream_id, .. } => {
                trace!("ignoring opaque frame on stream {}", stream_id);
            }
        }
    }

    fn on_headers(&mut self, headers: HeadersFrame) {
        let id = headers.stream_id;

        // trailers for a stream that is still receiving
        if let Some(entry) = self.streams.get_mut(id) {
            if !entry.remote_closed && headers.method.is_none() {
                entry.machine.recv_end(Some(headers.headers));
                entry.remote_closed = true;
                return;
            }
            debug!("unexpected HEADERS on open stream {}", id);
            self.reset_stream(id, Reason::PROTOCOL_ERROR);
            return;
        }

        if self.state != ConnState::Open {
            debug!("dropping stream {} received while closing", id);
            return;
        }
        if id % 2 == 0 || id <= self.streams.max_client_id {
            self.fatal(crate::Error::new_unexpected_message(), Reason::PROTOCOL_ERROR);
            return;
        }
        if let Some(max) = self.local_settings.max_concurrent_streams {
            if self.streams.len() as u32 >= max {
                debug!("refusing stream {}: too many concurrent streams", id);
                self.channel.send(Frame::Reset {
                    stream_id: id,
                    reason: Reason::REFUSED_STREAM,
                });
                self.pending_flush = true;
                return;
            }
        }

        let (method, path) = match (headers.method, headers.path) {
            (Some(method), Some(path)) => (method, path),
            _ => {
                debug!("stream {} missing required pseudo-headers", id);
                self.channel.send(Frame::Reset {
                    stream_id: id,
                    reason: Reason::PROTOCOL_ERROR,
                });
                self.pending_flush = true;
                return;
            }
        };

        let head = RequestHeaders::new_h2(
            method,
            path,
            headers.headers,
            headers.scheme.as_deref(),
            headers.authority,
        );
        trace!("incoming stream {}: {} {}", id, head.method(), head.path());
        self.idle_timer = None;

        let mut machine = ExchangeMachine::new(
            &self.controller,
            head,
            Protocol::Http2,
            false,
            self.remote_settings.enable_push,
        );
        machine.start(&self.controller);
        if headers.end_stream {
            machine.recv_end(None);
        }
        let mut entry = StreamEntry::new(
            machine,
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
        );
        entry.remote_closed = headers.end_stream;
        self.streams.insert(id, entry);
    }

    fn on_data(&mut self, data: DataFrame) {
        let id = data.stream_id;
        let len = data.data.len() as u32;

        if len > 0 && self.recv_flow.consume(len).is_err() {
            self.fatal(crate::Error::new_flow_control(), Reason::FLOW_CONTROL_ERROR);
            return;
        }

        let entry = match self.streams.get_mut(id) {
            Some(entry) => entry,
            None => {
                trace!("releasing {} bytes for unknown stream {}", len, id);
                // account the connection window back so the peer can go on
                if len > 0 {
                    let _ = self.recv_flow.release(len);
                    self.channel.send(Frame::WindowUpdate {
                        stream_id: 0,
                        increment: len,
                    });
                    self.pending_flush = true;
                }
                return;
            }
        };

        if len > 0 && entry.recv_flow.consume(len).is_err() {
            // hand the connection window back before dropping the stream
            let _ = self.recv_flow.release(len);
            self.reset_stream(id, Reason::FLOW_CONTROL_ERROR);
            return;
        }

        let outcome = if len == 0 {
            ChunkOutcome::Consumed
        } else {
            entry.machine.recv_chunk(data.data)
        };
        let end_stream = data.end_stream;

        match outcome {
            ChunkOutcome::Consumed | ChunkOutcome::NoSubscriber => {
                if len > 0 {
                    // credit returns only for bytes that were consumed (or
                    // deliberately discarded), never for dropped ones
                    let _ = entry.recv_flow.release(len);
                    let _ = self.recv_flow.release(len);
                    self.channel.send(Frame::WindowUpdate {
                        stream_id: 0,
                        increment: len,
                    });
                    self.channel.send(Frame::WindowUpdate {
                        stream_id: id,
                        increment: len,
                    });
                    self.pending_flush = true;
                }
            }
            ChunkOutcome::Overflow => {
                trace!(
                    "stream {} sink overflow, withholding {} bytes of credit",
                    id,
                    len
                );
            }
        }

        if end_stream {
            if let Some(entry) = self.streams.get_mut(id) {
                entry.machine.recv_end(None);
                entry.remote_closed = true;
            }
        }
    }

    // ===== egress =====

    fn poll_write(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        for id in self.streams.ids() {
            progress |= self.poll_stream(cx, id);
            if self.state == ConnState::Closed {
                break;
            }
        }
        progress
    }

    fn poll_stream(&mut self, cx: &mut Context<'_>, id: StreamId) -> bool {
        let mut progress = false;
        loop {
            // flush buffered data within the windows first
            match self.flush_stream_data(id) {
                Flushed::Progress => {
                    progress = true;
                    continue;
                }
                Flushed::Blocked => return progress,
                Flushed::Idle => {}
                Flushed::Gone => return progress,
            }

            let polled = {
                let controller = &self.controller;
                match self.streams.get_mut(id) {
                    Some(entry) => entry.machine.poll_output(cx, controller),
                    None => return progress,
                }
            };
            match polled {
                Poll::Pending => return progress,
                Poll::Ready(Ok(Some(output))) => {
                    progress = true;
                    self.on_output(id, output);
                }
                Poll::Ready(Ok(None)) => {
                    progress = true;
                    if let Some(mut entry) = self.streams.remove(id) {
                        entry.machine.dispose(None);
                        trace!("stream {} complete", id);
                    }
                    self.maybe_drained();
                    return progress;
                }
                Poll::Ready(Err(err)) => {
                    progress = true;
                    debug!("stream {} exchange error: {}", id, err);
                    if let Some(mut entry) = self.streams.remove(id) {
                        entry
                            .machine
                            .dispose(Some(crate::Error::new_connection_closed()));
                    }
                    self.fatal(err, Reason::INTERNAL_ERROR);
                    return progress;
                }
            }
        }
    }

    fn on_output(&mut self, id: StreamId, output: Output) {
        match output {
            Output::Push(push) => self.start_push(id, push),
            Output::Head { head, end } => {
                self.channel.send(Frame::Headers(HeadersFrame {
                    stream_id: id,
                    status: Some(head.status),
                    method: None,
                    scheme: None,
                    authority: None,
                    path: None,
                    headers: head.headers,
                    end_stream: end,
                    priority: None,
                }));
                self.pending_flush = true;
                if end {
                    if let Some(entry) = self.streams.get_mut(id) {
                        entry.local_closed = true;
                    }
                }
            }
            Output::Data(chunk) => {
                if let Some(entry) = self.streams.get_mut(id) {
                    debug_assert!(entry.pending_data.is_none());
                    entry.pending_data = Some(chunk);
                }
            }
            Output::End(trailers) => {
                if let Some(entry) = self.streams.get_mut(id) {
                    debug_assert!(entry.pending_end.is_none());
                    entry.pending_end = Some(trailers);
                }
            }
            Output::Upgrade(_) => {
                debug_assert!(false, "websocket upgrade on an HTTP/2 exchange");
            }
        }
    }

    /// Sends as much buffered stream data as the windows allow.
    fn flush_stream_data(&mut self, id: StreamId) -> Flushed {
        let max_frame = self.remote_settings.max_frame_size as usize;
        let conn_available = self.send_flow.available() as usize;

        let entry = match self.streams.get_mut(id) {
            Some(entry) => entry,
            None => return Flushed::Gone,
        };

        if let Some(mut chunk) = entry.pending_data.take() {
            let allowed = conn_available
                .min(entry.send_flow.available() as usize)
                .min(max_frame);
            if allowed == 0 {
                entry.pending_data = Some(chunk);
                trace!("stream {} blocked on send window", id);
                return Flushed::Blocked;
            }
            let send_len = allowed.min(chunk.len());
            let payload = chunk.split_to(send_len);
            let _ = entry.send_flow.consume(send_len as u32);
            if !chunk.is_empty() {
                // keep the remainder buffered, in order
                entry.pending_data = Some(chunk);
            }
            let _ = self.send_flow.consume(send_len as u32);
            self.channel.send(Frame::Data(DataFrame {
                stream_id: id,
                data: payload,
                end_stream: false,
            }));
            self.pending_flush = true;
            return Flushed::Progress;
        }

        if let Some(trailers) = entry.pending_end.take() {
            match trailers {
                None => {
                    self.channel.send(Frame::Data(DataFrame {
                        stream_id: id,
                        data: Bytes::new(),
                        end_stream: true,
                    }));
                }
                Some(trailers) => {
                    self.channel.send(Frame::Headers(HeadersFrame {
                        stream_id: id,
                        status: None,
                        method: None,
                        scheme: None,
                        authority: None,
                        path: None,
                        headers: trailers,
                        end_stream: true,
                        priority: None,
                    }));
                }
            }
            entry.local_closed = true;
            self.pending_flush = true;
            return Flushed::Progress;
        }

        Flushed::Idle
    }

    /// Reserves a promised stream and runs it as a normal exchange.
    fn start_push(&mut self, parent: StreamId, push: PushRequest) {
        if !self.remote_settings.enable_push || self.state != ConnState::Open {
            trace!("dropping push promise, pushing unavailable");
            return;
        }
        let promised_id = self.next_promise_id;
        self.next_promise_id += 2;
        debug!("promising stream {} for {}", promised_id, push.path);

        let PushRequest {
            method,
            path,
            headers,
        } = push;
        self.channel.send(Frame::PushPromise(PushPromiseFrame {
            stream_id: parent,
            promised_id,
            method: method.clone(),
            path: path.clone(),
            headers: headers.clone(),
        }));
        self.pending_flush = true;

        let head = RequestHeaders::new_h2(method, path, headers, None, None);
        let mut machine = ExchangeMachine::new(
            &self.controller,
            head,
            Protocol::Http2,
            false,
            // promised exchanges do not push further
            false,
        );
        machine.start(&self.controller);
        machine.recv_end(None);
        let mut entry = StreamEntry::new(
            machine,
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
        );
        entry.remote_closed = true;
        self.streams.insert(promised_id, entry);
    }

    // ===== shutdown =====

    fn reset_stream(&mut self, id: StreamId, reason: Reason) {
        self.channel.send(Frame::Reset {
            stream_id: id,
            reason,
        });
        self.pending_flush = true;
        if let Some(mut entry) = self.streams.remove(id) {
            entry.machine.reset(reason);
        }
        self.maybe_drained();
    }

    fn send_goaway(&mut self, reason: Reason) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        self.channel.send(Frame::GoAway {
            last_stream_id: self.streams.max_client_id,
            reason,
        });
        self.pending_flush = true;
    }

    fn fatal(&mut self, err: crate::Error, reason: Reason) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.send_goaway(reason);
        self.streams.dispose_all(crate::Error::new_connection_closed);
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
        }
        self.graceful_timer = None;
    }

    fn maybe_drained(&mut self) {
        if self.state == ConnState::Closing && self.streams.is_empty() {
            self.graceful_timer = None;
        }
        if self.state == ConnState::Open && self.streams.is_empty() {
            if let Some(idle) = self.config.idle_timeout {
                if self.idle_timer.is_none() {
                    self.idle_timer = Some(Box::pin(tokio::time::sleep(idle)));
                }
            }
        }
    }

    fn ready_to_close(&self) -> bool {
        self.state == ConnState::Closing && self.streams.is_empty()
    }

    fn poll_timers(&mut self, cx: &mut Context<'_>) {
        if let Some(ref mut timer) = self.graceful_timer {
            if timer.as_mut().poll(cx).is_ready() {
                debug!("graceful shutdown timed out, closing forcibly");
                self.graceful_timer = None;
                self.streams.dispose_all(crate::Error::new_connection_closed);
            }
        }
        if let Some(ref mut timer) = self.idle_timer {
            if timer.as_mut().poll(cx).is_ready() {
                trace!("idle timeout");
                self.idle_timer = None;
                if self.state == ConnState::Open && self.streams.is_empty() {
                    self.send_goaway(Reason::NO_ERROR);
                    self.state = ConnState::Closing;
                }
            }
        }
    }
}

enum Flushed {
    /// A frame went out; try again.
    Progress,
    /// Output is waiting on send window.
    Blocked,
    /// Nothing buffered.
    Idle,
    /// The stream is gone.
    Gone,
}

impl<T, S> Future for Http2Connection<T, S>
where
    T: Channel<Recv = Frame, Send = Frame> + Unpin,
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
                        this.fatal(crate::Error::new_io(err), Reason::INTERNAL_ERROR);
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

impl<T, S> fmt::Debug for Http2Connection<T, S>
where
    T: Channel<Recv = Frame, Send = Frame>,
    S: Controller,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("state", &self.state)
            .field("streams", &self.streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChannel;
    use crate::service::controller_fn;
    use futures_util::task::noop_waker_ref;
    use http::{HeaderMap, Method, StatusCode, Uri};

    type TestConn<S> = Http2Connection<MockChannel<Frame, Frame>, S>;

    fn cx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    fn headers_frame(stream_id: StreamId, path: &str, end_stream: bool) -> Frame {
        Frame::Headers(HeadersFrame {
            stream_id,
            status: None,
            method: Some(Method::GET),
            scheme: Some("http".to_owned()),
            authority: Some("test".to_owned()),
            path: Some(path.parse::<Uri>().unwrap()),
            headers: HeaderMap::new(),
            end_stream,
            priority: None,
        })
    }

    fn post_frame(stream_id: StreamId, path: &str) -> Frame {
        Frame::Headers(HeadersFrame {
            stream_id,
            status: None,
            method: Some(Method::POST),
            scheme: Some("http".to_owned()),
            authority: Some("test".to_owned()),
            path: Some(path.parse::<Uri>().unwrap()),
            headers: HeaderMap::new(),
            end_stream: false,
            priority: None,
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

    /// (stream_id, is_headers, end_stream) triples of everything sent.
    fn sent_shape(sent: &[Frame]) -> Vec<(StreamId, bool, bool)> {
        sent.iter()
            .filter_map(|f| match f {
                Frame::Headers(h) => Some((h.stream_id, true, h.end_stream)),
                Frame::Data(d) => Some((d.stream_id, false, d.end_stream)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn concurrent_streams_both_complete_in_stream_order() {
        let mut channel = MockChannel::new();
        channel.push_frame(headers_frame(1, "/a", true));
        channel.push_frame(headers_frame(3, "/b", true));

        let mut conn: TestConn<_> =
            Http2Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        let shape = sent_shape(&conn.channel.sent);
        for id in [1u32, 3] {
            let per_stream: Vec<_> = shape.iter().filter(|s| s.0 == id).collect();
            // HEADERS first, then DATA, end exactly once at the end
            assert!(per_stream[0].1, "stream {} should open with headers", id);
            assert!(per_stream.last().unwrap().2, "stream {} should end", id);
            assert_eq!(
                per_stream.iter().filter(|s| s.2).count(),
                1,
                "stream {} ends exactly once",
                id
            );
        }
        let statuses: Vec<StatusCode> = conn
            .channel
            .sent
            .iter()
            .filter_map(|f| match f {
                Frame::Headers(h) => h.status,
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::OK]);
    }

    #[tokio::test]
    async fn overflowed_chunks_return_no_window_credit() {
        // a handler that takes the body but never drains it
        let controller = controller_fn(|mut exchange| async move {
            let _body = exchange.request().body().expect("post body");
            futures_util::future::pending::<()>().await;
            Ok(())
        });
        let mut channel = MockChannel::new();
        channel.push_frame(post_frame(1, "/upload"));
        channel.push_frame(Frame::Data(DataFrame {
            stream_id: 1,
            data: bytes::Bytes::from_static(&[0u8; 100]),
            end_stream: false,
        }));
        channel.push_frame(Frame::Data(DataFrame {
            stream_id: 1,
            data: bytes::Bytes::from_static(&[0u8; 50]),
            end_stream: false,
        }));

        let mut conn: TestConn<_> =
            Http2Connection::new(channel, controller, ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        // first chunk fits the sink and is acknowledged on both windows;
        // the second overflows and must not be
        let updates: Vec<(StreamId, u32)> = conn
            .channel
            .sent
            .iter()
            .filter_map(|f| match f {
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                } => Some((*stream_id, *increment)),
                _ => None,
            })
            .collect();
        assert_eq!(updates, vec![(0, 100), (1, 100)]);
    }

    #[tokio::test]
    async fn peer_reset_disposes_the_stream() {
        let controller = controller_fn(|exchange| async move {
            let _ = exchange;
            futures_util::future::pending::<()>().await;
            Ok(())
        });
        let mut channel = MockChannel::new();
        channel.push_frame(headers_frame(1, "/slow", true));
        channel.push_frame(Frame::Reset {
            stream_id: 1,
            reason: Reason::CANCEL,
        });

        let mut conn: TestConn<_> =
            Http2Connection::new(channel, controller, ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());
        assert!(conn.streams.is_empty());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn ping_and_settings_are_acknowledged() {
        let mut channel = MockChannel::new();
        channel.push_frame(Frame::Ping {
            ack: false,
            payload: *b"12345678",
        });
        channel.push_frame(Frame::Settings {
            ack: false,
            settings: Settings {
                initial_window_size: 1024,
                ..Settings::default()
            },
        });

        let mut conn: TestConn<_> =
            Http2Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        assert!(conn
            .channel
            .sent
            .iter()
            .any(|f| matches!(f, Frame::Ping { ack: true, payload } if payload == b"12345678")));
        assert!(conn
            .channel
            .sent
            .iter()
            .any(|f| matches!(f, Frame::Settings { ack: true, .. })));
        assert_eq!(conn.remote_settings.initial_window_size, 1024);
    }

    #[tokio::test]
    async fn small_send_window_splits_data() {
        let mut channel = MockChannel::new();
        channel.push_frame(Frame::Settings {
            ack: false,
            settings: Settings {
                initial_window_size: 3,
                ..Settings::default()
            },
        });
        channel.push_frame(headers_frame(1, "/abcdef", true));

        let mut conn: TestConn<_> =
            Http2Connection::new(channel, echo_path_controller(), ServerConfig::default());
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());

        // only 3 bytes fit the stream window; the rest waits for credit
        let data: Vec<&DataFrame> = conn
            .channel
            .sent
            .iter()
            .filter_map(|f| match f {
                Frame::Data(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].data.len(), 3);
        assert!(!data[0].end_stream);

        // credit arrives, the remainder flows
        conn.channel.push_frame(Frame::WindowUpdate {
            stream_id: 1,
            increment: 100,
        });
        assert!(Pin::new(&mut conn).poll(&mut cx()).is_pending());
        let total: usize = conn
            .channel
            .sent
            .iter()
            .filter_map(|f| match f {
                Frame::Data(d) => Some(d.data.len()),
                _ => None,
            })
            .sum();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn graceful_shutdown_sends_goaway_and_closes() {
        let channel = MockChannel::new();
        let mut conn: TestConn<_> =
            Http2Connection::new(channel, echo_path_controller(), ServerConfig::default());
        Pin::new(&mut conn).shutdown_gracefully();
        match Pin::new(&mut conn).poll(&mut cx()) {
            Poll::Ready(result) => result.unwrap(),
            Poll::Pending => panic!("no streams, should close"),
        }
        assert!(conn
            .channel
            .sent
            .iter()
            .any(|f| matches!(f, Frame::GoAway { reason, .. } if *reason == Reason::NO_ERROR)));
        assert_eq!(conn.channel.shutdowns, 1);
    }

    #[tokio::test]
    async fn even_stream_id_is_a_protocol_error() {
        let mut channel = MockChannel::new();
        channel.push_frame(headers_frame(2, "/a", true));

        let mut conn: TestConn<_> =
            Http2Connection::new(channel, echo_path_controller(), ServerConfig::default());
        let result = match Pin::new(&mut conn).poll(&mut cx()) {
            Poll::Ready(result) => result,
            Poll::Pending => panic!("protocol error should close the connection"),
        };
        assert!(result.is_err());
        assert!(conn
            .channel
            .sent
            .iter()
            .any(|f| matches!(f, Frame::GoAway { reason, .. } if *reason == Reason::PROTOCOL_ERROR)));
    }
}
