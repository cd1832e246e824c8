//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::time::SystemTime;

use http::{Method, StatusCode};

use crate::proto::h2::Reason;

/// Result type often returned from methods that can have estuary `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections and exchanges.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(super) enum Kind {
    /// A malformed framed message arrived from the wire.
    Parse(Parse),
    /// A malformed multipart body.
    Multipart(Multipart),
    /// A WebSocket-side failure, delegated to the WebSocket layer.
    Ws(Ws),
    /// A connection received a message when not waiting for one.
    UnexpectedMessage,
    /// The connection was closed while exchanges were still in flight.
    ConnectionClosed,
    /// A stream was reset by the peer or locally (HTTP/2 only).
    Reset(Reason),
    /// Indicates a body channel is closed.
    ChannelClosed,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    Io,
    /// Error while reading a body from the connection.
    Body,
    /// Error while writing a body to the connection.
    BodyWrite,
    /// Error shutting down the channel.
    Shutdown,
    /// The peer violated HTTP/2 flow control accounting.
    FlowControl,
    User(User),
}

#[derive(Debug)]
pub(super) enum Parse {
    /// The request-target exceeded the configured limit.
    UriTooLong,
    /// The header section exceeded the configured limit.
    HeaderFieldsTooLarge,
    /// Any other malformed request head or content framing.
    BadRequest,
    Version,
    /// A required `Host` header was absent on an HTTP/1.1 request.
    MissingHost,
}

#[derive(Debug)]
pub(super) enum Multipart {
    /// Boundary framing did not match the declared delimiter.
    MalformedBody,
    /// The outer content-type had no `boundary` parameter.
    MissingBoundary,
    /// A part arrived without a `Content-Disposition` field.
    MissingDisposition,
    /// A `multipart/mixed` entry had neither a name nor a filename.
    FieldlessMixedEntry,
    /// `multipart/mixed` nested more than one level deep.
    NestedMixed,
    /// A configured `multipart_max_*` limit was exceeded.
    LimitExceeded,
}

#[derive(Debug)]
pub(super) enum Ws {
    /// The opening handshake could not be completed.
    Handshake,
    /// A WebSocket frame violated the protocol.
    CorruptedFrame,
    /// The closing handshake did not finish before the configured timeout.
    CloseTimedOut,
}

#[derive(Debug)]
pub(super) enum User {
    /// Error from the user's exchange handler.
    Handler,
    /// Error from the user's response body stream.
    Body,
    /// Response headers were already written when a mutation or a second
    /// response was attempted.
    HeadersWritten,
    /// A WebSocket upgrade was requested on a connection that cannot do one.
    UpgradeUnavailable,
}

impl Error {
    /// Returns true if this was caused by a malformed framed message.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was caused by a malformed multipart body.
    pub fn is_multipart(&self) -> bool {
        matches!(self.inner.kind, Kind::Multipart(_))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if the connection was closed with work in flight.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionClosed)
    }

    /// Returns true if a body channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if this is a stream reset.
    pub fn is_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::Reset(_))
    }

    /// Returns true if response headers had already left the encoder when
    /// this failure occurred, meaning no recovery response is possible.
    pub fn is_headers_written(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::HeadersWritten))
    }

    /// Returns true if this belongs to the WebSocket layer.
    pub fn is_ws(&self) -> bool {
        matches!(self.inner.kind, Kind::Ws(_))
    }

    /// Returns the reset reason, if this is a stream reset.
    pub fn reset_reason(&self) -> Option<Reason> {
        match self.inner.kind {
            Kind::Reset(reason) => Some(reason),
            _ => None,
        }
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(super) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(super) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(ref typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    /// The status a minimal synthesized response should carry for this
    /// error, when one can still be sent.
    pub(crate) fn synthesized_status(&self) -> StatusCode {
        match self.inner.kind {
            Kind::Parse(Parse::UriTooLong) => StatusCode::URI_TOO_LONG,
            Kind::Parse(Parse::HeaderFieldsTooLarge) => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Kind::Parse(_) | Kind::Multipart(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn new_uri_too_long() -> Error {
        Error::new(Kind::Parse(Parse::UriTooLong))
    }

    pub(crate) fn new_header_fields_too_large() -> Error {
        Error::new(Kind::Parse(Parse::HeaderFieldsTooLarge))
    }

    pub(crate) fn new_bad_request() -> Error {
        Error::new(Kind::Parse(Parse::BadRequest))
    }

    pub(crate) fn new_missing_host() -> Error {
        Error::new(Kind::Parse(Parse::MissingHost))
    }

    pub(crate) fn new_version() -> Error {
        Error::new(Kind::Parse(Parse::Version))
    }

    pub(crate) fn new_unexpected_message() -> Error {
        Error::new(Kind::UnexpectedMessage)
    }

    pub(crate) fn new_connection_closed() -> Error {
        Error::new(Kind::ConnectionClosed)
    }

    pub(crate) fn new_reset(reason: Reason) -> Error {
        Error::new(Kind::Reset(reason))
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Body).with(cause)
    }

    pub(crate) fn new_body_write<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::BodyWrite).with(cause)
    }

    pub(crate) fn new_shutdown(cause: std::io::Error) -> Error {
        Error::new(Kind::Shutdown).with(cause)
    }

    pub(crate) fn new_flow_control() -> Error {
        Error::new(Kind::FlowControl)
    }

    pub(crate) fn new_multipart(kind: Multipart) -> Error {
        Error::new(Kind::Multipart(kind))
    }

    pub(crate) fn new_ws_handshake() -> Error {
        Error::new(Kind::Ws(Ws::Handshake))
    }

    pub(crate) fn new_ws_corrupted_frame() -> Error {
        Error::new(Kind::Ws(Ws::CorruptedFrame))
    }

    pub(crate) fn new_ws_close_timeout() -> Error {
        Error::new(Kind::Ws(Ws::CloseTimedOut))
    }

    fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(crate) fn new_user_handler<E: Into<Cause>>(cause: E) -> Error {
        Error::new_user(User::Handler).with(cause)
    }

    pub(crate) fn new_user_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new_user(User::Body).with(cause)
    }

    pub(crate) fn new_headers_written() -> Error {
        Error::new_user(User::HeadersWritten)
    }

    pub(crate) fn new_upgrade_unavailable() -> Error {
        Error::new_user(User::UpgradeUnavailable)
    }

    // Constructors for framer implementations: a channel reports decode
    // failures through these, and the connection picks the minimal
    // response and the shutdown behavior from the kind.

    /// A request-target longer than the framer accepts.
    pub fn uri_too_long() -> Error {
        Error::new_uri_too_long()
    }

    /// A header section larger than the framer accepts.
    pub fn header_fields_too_large() -> Error {
        Error::new_header_fields_too_large()
    }

    /// Any other malformed message the framer rejects.
    pub fn bad_request() -> Error {
        Error::new_bad_request()
    }

    /// A transport-level failure below the framer.
    pub fn io(cause: std::io::Error) -> Error {
        Error::new_io(cause)
    }

    /// A WebSocket frame that violates the protocol.
    pub fn corrupted_ws_frame() -> Error {
        Error::new_ws_corrupted_frame()
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::UriTooLong) => "request URI too long",
            Kind::Parse(Parse::HeaderFieldsTooLarge) => "request header fields too large",
            Kind::Parse(Parse::BadRequest) => "malformed request",
            Kind::Parse(Parse::Version) => "unsupported HTTP version",
            Kind::Parse(Parse::MissingHost) => "request is missing a Host header",
            Kind::Multipart(Multipart::MalformedBody) => "malformed multipart body",
            Kind::Multipart(Multipart::MissingBoundary) => {
                "multipart content-type is missing a boundary parameter"
            }
            Kind::Multipart(Multipart::MissingDisposition) => {
                "multipart part is missing a content-disposition"
            }
            Kind::Multipart(Multipart::FieldlessMixedEntry) => {
                "multipart/mixed entry has no field"
            }
            Kind::Multipart(Multipart::NestedMixed) => {
                "multipart/mixed nested more than one level deep"
            }
            Kind::Multipart(Multipart::LimitExceeded) => "multipart limit exceeded",
            Kind::Ws(Ws::Handshake) => "WebSocket handshake failed",
            Kind::Ws(Ws::CorruptedFrame) => "corrupted WebSocket frame",
            Kind::Ws(Ws::CloseTimedOut) => "WebSocket close handshake timed out",
            Kind::UnexpectedMessage => "received unexpected message from connection",
            Kind::ConnectionClosed => "connection was closed",
            Kind::Reset(_) => "stream was reset",
            Kind::ChannelClosed => "channel closed",
            Kind::Io => "connection error",
            Kind::Body => "error reading a body from connection",
            Kind::BodyWrite => "error writing a body to connection",
            Kind::Shutdown => "error shutting down connection",
            Kind::FlowControl => "flow control accounting violated",
            Kind::User(User::Handler) => "error from the exchange handler",
            Kind::User(User::Body) => "error from the response body stream",
            Kind::User(User::HeadersWritten) => "response headers already written",
            Kind::User(User::UpgradeUnavailable) => "WebSocket upgrade unavailable",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("estuary::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

// ===== impl HttpError =====

/// A handler error that selects the HTTP response status.
///
/// Returned (or wrapped as a cause) by exchange handlers so that the error
/// exchange knows what status to send. The built-in fallback handler walks
/// the cause chain looking for one of these.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    allow: Vec<Method>,
    retry_after: Option<SystemTime>,
    message: Option<String>,
}

impl HttpError {
    /// An error with the given response status.
    pub fn new(status: StatusCode) -> HttpError {
        HttpError {
            status,
            allow: Vec::new(),
            retry_after: None,
            message: None,
        }
    }

    /// A `404 Not Found` error.
    pub fn not_found() -> HttpError {
        HttpError::new(StatusCode::NOT_FOUND)
    }

    /// A `400 Bad Request` error.
    pub fn bad_request() -> HttpError {
        HttpError::new(StatusCode::BAD_REQUEST)
    }

    /// A `405 Method Not Allowed` error, advertising the allowed methods.
    pub fn method_not_allowed(allow: Vec<Method>) -> HttpError {
        HttpError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            allow,
            retry_after: None,
            message: None,
        }
    }

    /// A `503 Service Unavailable` error with an optional retry time.
    pub fn service_unavailable(retry_after: Option<SystemTime>) -> HttpError {
        HttpError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            allow: Vec::new(),
            retry_after,
            message: None,
        }
    }

    /// A `500 Internal Server Error` error.
    pub fn internal_server_error() -> HttpError {
        HttpError::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Attaches a human readable message.
    pub fn with_message<S: Into<String>>(mut self, message: S) -> HttpError {
        self.message = Some(message.into());
        self
    }

    /// The status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Methods to advertise in an `Allow` header, for `405` errors.
    pub fn allowed_methods(&self) -> &[Method] {
        &self.allow
    }

    /// The time to advertise in a `Retry-After` header, for `503` errors.
    pub fn retry_after(&self) -> Option<SystemTime> {
        self.retry_after
    }

    /// Whether this is a server-class (5xx) error.
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message {
            Some(ref msg) => write!(f, "{}: {}", self.status, msg),
            None => fmt::Display::fmt(&self.status, f),
        }
    }
}

impl StdError for HttpError {}

impl From<HttpError> for Error {
    fn from(err: HttpError) -> Error {
        Error::new_user_handler(err)
    }
}

/// The class a handler error is logged by: server errors at error level,
/// everything else at warn.
pub(crate) fn is_server_class(err: &Error) -> bool {
    match err.find_source::<HttpError>() {
        Some(http_err) => http_err.is_server_error(),
        None => true,
    }
}
