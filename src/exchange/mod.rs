//! The exchange lifecycle shared by both protocol variants.
//!
//! One exchange is one request/response pair. The connection owns an
//! [`ExchangeMachine`] per exchange and polls it for outputs; user code
//! sees the [`Exchange`] handed to its controller. Failure routes through
//! an error exchange, then a single built-in last resort; a failure past
//! the last resort is terminal for the connection.

mod error;

pub(crate) use self::error::generic_error_handler;

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future;
use http::{HeaderMap, Method};

use crate::body::channel::{self, Rejected, Sender};
use crate::body::{finish_body, BodyStream};
use crate::channel::Protocol;
use crate::common;
use crate::proto::h2::{PushRequest, Reason};
use crate::proto::ResponseHead;
use crate::request::{method_has_body, Request, RequestHeaders};
use crate::response::{Response, ResponseCell};
use crate::service::{Completion, Controller};
use crate::ws::Registration;

// ===== impl Exchange =====

/// One exchange, as seen by its handler.
pub struct Exchange<Ctx> {
    context: Arc<Ctx>,
    request: Request,
    response: Response,
    protocol: Protocol,
    ws_available: bool,
    can_push: bool,
}

impl<Ctx> Exchange<Ctx> {
    /// The per-exchange context.
    pub fn context(&self) -> &Ctx {
        &self.context
    }

    /// The request side.
    pub fn request(&mut self) -> &mut Request {
        &mut self.request
    }

    /// The response side.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// The protocol this exchange arrived on.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Registers a WebSocket upgrade to run once this handler completes.
    ///
    /// Fails when upgrades are unavailable here: not HTTP/1.x, disabled by
    /// config, or not a GET. Header-level handshake validation happens
    /// later, on the connection; a failure there takes the registered
    /// fallback (see [`web_socket_fallback`](Exchange::web_socket_fallback))
    /// or the error path.
    pub fn web_socket<I, S, H>(&mut self, subprotocols: I, handler: H) -> crate::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        H: FnOnce(crate::ws::WebSocketExchange) -> Completion + Send + 'static,
    {
        if !self.ws_available || self.request.headers().method() != Method::GET {
            return Err(crate::Error::new_upgrade_unavailable());
        }
        let registration = Registration {
            subprotocols: subprotocols.into_iter().map(Into::into).collect(),
            handler: Box::new(handler),
            fallback: None,
        };
        self.response.inner().lock().ws = Some(registration);
        Ok(())
    }

    /// Configures the response sent when the WebSocket handshake fails,
    /// keeping the channel on HTTP.
    pub fn web_socket_fallback<F>(&mut self, fallback: F)
    where
        F: FnOnce(&Response) + Send + 'static,
    {
        if let Some(ref mut registration) = self.response.inner().lock().ws {
            registration.fallback = Some(Box::new(fallback));
        }
    }

    /// Registers a server push (HTTP/2 only). The promised response runs
    /// as a normal exchange once this one's headers go out.
    pub fn push(&self, push: PushRequest) -> crate::Result<()> {
        if !self.can_push {
            return Err(crate::Error::new_upgrade_unavailable());
        }
        self.response.inner().lock().pushes.push(push);
        Ok(())
    }
}

impl<Ctx> fmt::Debug for Exchange<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("protocol", &self.protocol)
            .finish()
    }
}

// ===== impl ErrorExchange =====

/// The secondary exchange run when the primary handler fails.
pub struct ErrorExchange<Ctx> {
    context: Arc<Ctx>,
    request: RequestHeaders,
    response: Response,
    error: Arc<crate::Error>,
}

impl<Ctx> ErrorExchange<Ctx> {
    /// The context shared with the failed exchange.
    pub fn context(&self) -> &Ctx {
        &self.context
    }

    /// The failed request's head. Its body is gone.
    pub fn request(&self) -> &RequestHeaders {
        &self.request
    }

    /// The fresh response to configure.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// What the primary handler failed with.
    pub fn error(&self) -> &crate::Error {
        &self.error
    }
}

impl<Ctx> fmt::Debug for ErrorExchange<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorExchange")
            .field("error", &*self.error)
            .finish()
    }
}

// ===== impl ExchangeMachine =====

/// Which flavor of exchange is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Normal,
    Error,
    LastResort,
}

/// What a chunk handed to the request-body sink became.
///
/// HTTP/2 returns flow-control credit only for `Consumed` and
/// `NoSubscriber` (deliberately discarded) bytes, never for `Overflow`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkOutcome {
    /// Enqueued to the sink exactly once.
    Consumed,
    /// The subscriber is behind; the chunk was released, not enqueued.
    Overflow,
    /// Nobody subscribed; the chunk was released.
    NoSubscriber,
}

/// An output the connection must translate into wire frames.
pub(crate) enum Output {
    /// Announce a promised stream before the response head (HTTP/2 only).
    Push(PushRequest),
    /// The response head. `end` means no body output will follow.
    Head { head: ResponseHead, end: bool },
    /// One response body chunk.
    Data(Bytes),
    /// The response is complete, with optional trailers.
    End(Option<HeaderMap>),
    /// The handler registered a WebSocket; run the handshake (HTTP/1.x).
    Upgrade(Registration),
}

enum State {
    /// Constructed, handler not yet invoked (queued behind the pipeline).
    Queued { request: Option<Request> },
    /// Handler (or error handler) running.
    Handling { fut: Completion, kind: Kind },
    /// Pushes announced, head pending, body stashed for after the head.
    SendHead {
        head: Option<ResponseHead>,
        end: bool,
        stream: Option<BodyStream>,
        trailers: Option<HeaderMap>,
    },
    /// Head gone out, draining the body publisher.
    Streaming {
        stream: Option<BodyStream>,
        trailers: Option<HeaderMap>,
    },
    /// Everything sent.
    Complete,
    /// Disposed or reset; inert.
    Closed,
}

/// The connection-side state machine for one exchange.
pub(crate) struct ExchangeMachine<Ctx> {
    head: RequestHeaders,
    is_head: bool,
    keep_alive: bool,
    disposed: bool,
    reset: bool,
    started: bool,
    context: Arc<Ctx>,
    cell: Arc<ResponseCell>,
    body_tx: Option<Sender>,
    pending_pushes: VecDeque<PushRequest>,
    state: State,
    protocol: Protocol,
    ws_available: bool,
    can_push: bool,
}

impl<Ctx: Send + Sync + 'static> ExchangeMachine<Ctx> {
    /// Builds the machine and its request plumbing. The handler is not
    /// invoked until [`start`](ExchangeMachine::start).
    pub(crate) fn new<C>(
        controller: &C,
        head: RequestHeaders,
        protocol: Protocol,
        ws_available: bool,
        can_push: bool,
    ) -> ExchangeMachine<Ctx>
    where
        C: Controller<Context = Ctx>,
    {
        let context = Arc::new(controller.create_context());
        let (body_tx, body_rx) = if method_has_body(head.method()) {
            let (tx, rx) = channel::channel(head.content_length());
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (_, cell) = Response::new();
        let is_head = head.method() == Method::HEAD;
        let keep_alive = head.should_keep_alive();
        let request = Request::new(head.clone(), body_rx);

        ExchangeMachine {
            head,
            is_head,
            keep_alive,
            disposed: false,
            reset: false,
            started: false,
            context,
            cell,
            body_tx,
            pending_pushes: VecDeque::new(),
            state: State::Queued {
                request: Some(request),
            },
            protocol,
            ws_available,
            can_push,
        }
    }

    pub(crate) fn head(&self) -> &RequestHeaders {
        &self.head
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    /// Invokes the handler. For HTTP/1.x this happens when the exchange
    /// reaches the front of the pipeline; for HTTP/2, immediately.
    pub(crate) fn start<C>(&mut self, controller: &C)
    where
        C: Controller<Context = Ctx>,
    {
        debug_assert!(!self.started, "exchange started twice");
        let request = match self.state {
            State::Queued { ref mut request } => match request.take() {
                Some(request) => request,
                None => return,
            },
            _ => return,
        };
        trace!("exchange start: {} {}", self.head.method(), self.head.path());
        let exchange = Exchange {
            context: self.context.clone(),
            request,
            response: Response::from_cell(self.cell.clone()),
            protocol: self.protocol,
            ws_available: self.ws_available,
            can_push: self.can_push,
        };
        let fut = controller.defer(exchange);
        self.state = State::Handling {
            fut,
            kind: Kind::Normal,
        };
        self.started = true;
    }

    /// Feeds one request body chunk to the sink.
    pub(crate) fn recv_chunk(&mut self, chunk: Bytes) -> ChunkOutcome {
        let tx = match self.body_tx {
            Some(ref mut tx) => tx,
            None => return ChunkOutcome::NoSubscriber,
        };
        match tx.try_send_data(chunk) {
            Ok(()) => ChunkOutcome::Consumed,
            Err(Rejected::Overflow(chunk)) => {
                trace!("request body sink overflow, releasing {} bytes", chunk.len());
                drop(chunk);
                ChunkOutcome::Overflow
            }
            Err(Rejected::Closed(chunk)) => {
                trace!("request body unsubscribed, releasing {} bytes", chunk.len());
                drop(chunk);
                ChunkOutcome::NoSubscriber
            }
        }
    }

    /// Completes the request body, optionally with trailers.
    pub(crate) fn recv_end(&mut self, trailers: Option<HeaderMap>) {
        if let Some(tx) = self.body_tx.take() {
            tx.complete(trailers);
        }
    }

    /// Pulls the next output. `Ready(Ok(None))` means the exchange is
    /// complete; `Ready(Err(_))` is unrecoverable for this connection.
    pub(crate) fn poll_output<C>(
        &mut self,
        cx: &mut Context<'_>,
        controller: &C,
    ) -> Poll<crate::Result<Option<Output>>>
    where
        C: Controller<Context = Ctx>,
    {
        loop {
            match self.state {
                State::Queued { .. } => return Poll::Pending,
                State::Handling { ref mut fut, kind } => match fut.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(())) => {
                        if kind == Kind::Normal {
                            let ws = self.cell.lock().ws.take();
                            if let Some(registration) = ws {
                                self.state = State::Complete;
                                return Poll::Ready(Ok(Some(Output::Upgrade(registration))));
                            }
                        }
                        self.prepare_send();
                    }
                    Poll::Ready(Err(err)) => {
                        if let Err(fatal) = self.handle_error(err, controller) {
                            return Poll::Ready(Err(fatal));
                        }
                    }
                },
                State::SendHead {
                    ref mut head,
                    end,
                    ref mut stream,
                    ref mut trailers,
                } => {
                    if let Some(push) = self.pending_pushes.pop_front() {
                        return Poll::Ready(Ok(Some(Output::Push(push))));
                    }
                    let head = head.take().expect("head emitted twice");
                    let stream = stream.take();
                    let trailers = trailers.take();
                    self.state = if end {
                        State::Complete
                    } else {
                        State::Streaming { stream, trailers }
                    };
                    return Poll::Ready(Ok(Some(Output::Head { head, end })));
                }
                State::Streaming {
                    ref mut stream,
                    ref mut trailers,
                } => {
                    let next = match stream {
                        Some(s) => futures_core::Stream::poll_next(s.as_mut(), cx),
                        None => Poll::Ready(None),
                    };
                    match next {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Some(Ok(chunk))) => {
                            return Poll::Ready(Ok(Some(Output::Data(chunk))));
                        }
                        Poll::Ready(Some(Err(err))) => {
                            // headers are on the wire; nothing to recover
                            return Poll::Ready(Err(crate::Error::new_user_body(err)));
                        }
                        Poll::Ready(None) => {
                            let trailers = trailers.take();
                            self.state = State::Complete;
                            return Poll::Ready(Ok(Some(Output::End(trailers))));
                        }
                    }
                }
                State::Complete | State::Closed => return Poll::Ready(Ok(None)),
            }
        }
    }

    /// Turns the accumulated response cell into head + body outputs.
    fn prepare_send(&mut self) {
        let mut response = self.cell.take_state();
        self.pending_pushes = response.pushes.drain(..).collect();
        common::ensure_date_header(&mut response.headers);

        let finished = finish_body(response.body, response.transforms, response.trailers);
        if let Some(len) = finished.content_length {
            if !response.headers.contains_key(http::header::CONTENT_LENGTH)
                && real_body_allowed(response.status)
            {
                response
                    .headers
                    .insert(http::header::CONTENT_LENGTH, common::content_length_value(len));
            }
        }

        self.cell.mark_written();
        let head = ResponseHead {
            status: response.status,
            headers: response.headers,
        };

        // HEAD: metadata goes out, the body does not
        let stream = if self.is_head { None } else { finished.stream };
        let trailers = if self.is_head { None } else { finished.trailers };

        let end = stream.is_none() && trailers.is_none();
        self.state = State::SendHead {
            head: Some(head),
            end,
            stream,
            trailers,
        };
    }

    /// Routes a failure: error exchange, then last resort, then fatal.
    pub(crate) fn handle_error<C>(
        &mut self,
        err: crate::Error,
        controller: &C,
    ) -> crate::Result<()>
    where
        C: Controller<Context = Ctx>,
    {
        if self.reset {
            // a reset exchange surfaces nothing
            self.state = State::Closed;
            return Ok(());
        }
        if self.cell.is_written() {
            debug!("exchange failed after headers were written: {}", err);
            return Err(err);
        }
        let kind = match self.state {
            State::Handling { kind, .. } => kind,
            _ => Kind::Normal,
        };
        match kind {
            Kind::LastResort => {
                error!("last-resort error exchange failed: {}", err);
                Err(err)
            }
            Kind::Normal => {
                if crate::error::is_server_class(&err) {
                    error!("exchange handler failed: {}", err);
                } else {
                    warn!("exchange handler failed: {}", err);
                }
                let error = Arc::new(err);
                let (response, cell) = Response::new();
                self.cell = cell;
                let exchange = ErrorExchange {
                    context: self.context.clone(),
                    request: self.head.clone(),
                    response,
                    error: error.clone(),
                };
                self.state = State::Handling {
                    fut: controller.defer_error(exchange),
                    kind: Kind::Error,
                };
                Ok(())
            }
            Kind::Error => {
                debug!("error handler failed, falling back to last resort: {}", err);
                let (response, cell) = Response::new();
                self.cell = cell;
                let result = generic_error_handler(&response, &err);
                self.state = State::Handling {
                    fut: Box::pin(future::ready(result)),
                    kind: Kind::LastResort,
                };
                Ok(())
            }
        }
    }

    /// Completes a failed WebSocket handshake with the registered fallback
    /// response, keeping the channel on HTTP.
    pub(crate) fn apply_ws_fallback(&mut self, fallback: Box<dyn FnOnce(&Response) + Send>) {
        let (response, cell) = Response::new();
        self.cell = cell;
        fallback(&response);
        self.state = State::Handling {
            fut: Box::pin(future::ready(Ok(()))),
            kind: Kind::Error,
        };
    }

    /// Releases everything this exchange holds. Idempotent; a cause means
    /// abnormal termination and is surfaced to the body subscriber.
    pub(crate) fn dispose(&mut self, cause: Option<crate::Error>) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(mut tx) = self.body_tx.take() {
            match cause {
                Some(cause) => tx.send_error(cause),
                None => tx.complete(None),
            }
        }
        self.pending_pushes.clear();
        self.state = State::Closed;
    }

    /// Resets the exchange: suppresses any response and error surfacing.
    /// Idempotent.
    pub(crate) fn reset(&mut self, reason: Reason) {
        if self.reset {
            return;
        }
        self.reset = true;
        trace!("exchange reset: {}", reason);
        self.dispose(Some(crate::Error::new_reset(reason)));
    }
}

impl<Ctx> fmt::Debug for ExchangeMachine<Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Queued { .. } => "Queued",
            State::Handling { .. } => "Handling",
            State::SendHead { .. } => "SendHead",
            State::Streaming { .. } => "Streaming",
            State::Complete => "Complete",
            State::Closed => "Closed",
        };
        f.debug_struct("ExchangeMachine")
            .field("state", &state)
            .field("disposed", &self.disposed)
            .field("reset", &self.reset)
            .finish()
    }
}

fn real_body_allowed(status: http::StatusCode) -> bool {
    !(status.is_informational()
        || status == http::StatusCode::NO_CONTENT
        || status == http::StatusCode::NOT_MODIFIED)
}
