//! HTTP/1.x framed messages and the pipelined connection.

pub(crate) mod conn;
pub(crate) mod queue;

pub use self::conn::Http1Connection;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};

use crate::proto::ResponseHead;

/// One framed HTTP/1.x message arriving from the wire.
///
/// The external framer delivers these in order: a [`Start`](Frame::Start),
/// zero or more [`Chunk`](Frame::Chunk)s, then one [`End`](Frame::End) —
/// possibly carrying trailers, possibly the empty sentinel right after the
/// start for bodyless requests. After a WebSocket upgrade the same channel
/// carries [`Ws`](Frame::Ws) frames instead.
#[derive(Debug)]
pub enum Frame {
    /// A request head.
    Start(RequestStart),
    /// A piece of the current request's body.
    Chunk(Bytes),
    /// The end of the current request's body, with optional trailers.
    End(Option<HeaderMap>),
    /// A WebSocket frame, after the pipeline switched protocols.
    Ws(crate::ws::Frame),
}

/// A framed request head.
#[derive(Debug)]
pub struct RequestStart {
    /// The request method.
    pub method: Method,
    /// The request-target.
    pub target: Uri,
    /// The request version, 1.0 or 1.1.
    pub version: Version,
    /// The decoded header fields, in arrival order.
    pub headers: HeaderMap,
}

/// One framed HTTP/1.x message leaving toward the wire.
#[derive(Debug)]
pub enum OutFrame {
    /// An interim `100 Continue`.
    Continue,
    /// A response head. Response framing (content-length vs chunked) is the
    /// encoder's concern.
    Head(ResponseHead),
    /// A piece of the current response's body.
    Chunk(Bytes),
    /// The end of the current response, with optional trailers.
    End(Option<HeaderMap>),
    /// A WebSocket frame, after the pipeline switched protocols.
    Ws(crate::ws::Frame),
}
