//! The HTTP/2 frame vocabulary, as delivered by an external framer.
//!
//! Frames arrive parsed: header blocks are already decoded maps, stream
//! ids are plain integers. The connection only multiplexes and accounts.

use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

/// A stream identifier. Client-initiated streams are odd, server-reserved
/// (push) streams even. Zero addresses the connection itself.
pub type StreamId = u32;

/// One framed HTTP/2 message.
#[derive(Debug)]
pub enum Frame {
    /// A decoded HEADERS block (with any CONTINUATIONs already merged).
    Headers(HeadersFrame),
    /// A DATA frame.
    Data(DataFrame),
    /// RST_STREAM.
    Reset {
        /// The stream being reset.
        stream_id: StreamId,
        /// Why.
        reason: Reason,
    },
    /// WINDOW_UPDATE, for a stream or (id 0) the connection.
    WindowUpdate {
        /// The stream, or zero for the connection window.
        stream_id: StreamId,
        /// The credit, in bytes.
        increment: u32,
    },
    /// PRIORITY.
    Priority {
        /// The stream being (re)prioritized.
        stream_id: StreamId,
        /// Its new dependency.
        dependency: StreamDependency,
    },
    /// SETTINGS, or its acknowledgement.
    Settings {
        /// Whether this acknowledges our settings.
        ack: bool,
        /// The peer's settings when `ack` is false.
        settings: Settings,
    },
    /// PING, or its acknowledgement.
    Ping {
        /// Whether this acknowledges our ping.
        ack: bool,
        /// The opaque payload, echoed back on ack.
        payload: [u8; 8],
    },
    /// GOAWAY.
    GoAway {
        /// The last stream id the sender will process.
        last_stream_id: StreamId,
        /// Why.
        reason: Reason,
    },
    /// PUSH_PROMISE. Only ever sent by a server.
    PushPromise(PushPromiseFrame),
    /// An extension frame this crate forwards opaquely.
    Opaque {
        /// The stream it belongs to.
        stream_id: StreamId,
        /// The raw frame, header included.
        payload: Bytes,
    },
}

/// A decoded HEADERS block with its pseudo-headers pulled out.
#[derive(Debug)]
pub struct HeadersFrame {
    /// The stream carrying the block.
    pub stream_id: StreamId,
    /// `:status`, present on response blocks only.
    pub status: Option<StatusCode>,
    /// `:method`, absent on trailer and response blocks.
    pub method: Option<Method>,
    /// `:scheme`.
    pub scheme: Option<String>,
    /// `:authority`.
    pub authority: Option<String>,
    /// `:path`.
    pub path: Option<Uri>,
    /// The regular header fields.
    pub headers: HeaderMap,
    /// Whether this frame ends the stream.
    pub end_stream: bool,
    /// Optional priority carried on the frame.
    pub priority: Option<StreamDependency>,
}

/// A DATA frame.
#[derive(Debug)]
pub struct DataFrame {
    /// The stream the data belongs to.
    pub stream_id: StreamId,
    /// The payload, padding already stripped.
    pub data: Bytes,
    /// Whether this frame ends the stream.
    pub end_stream: bool,
}

/// A PUSH_PROMISE frame.
#[derive(Debug)]
pub struct PushPromiseFrame {
    /// The stream the promise is sent on.
    pub stream_id: StreamId,
    /// The reserved server stream.
    pub promised_id: StreamId,
    /// `:method` of the promised request.
    pub method: Method,
    /// `:path` of the promised request.
    pub path: Uri,
    /// The promised request's header fields.
    pub headers: HeaderMap,
}

/// A stream dependency from a PRIORITY frame or HEADERS priority flag.
#[derive(Debug, Clone, Copy)]
pub struct StreamDependency {
    /// The stream depended on.
    pub dependency_id: StreamId,
    /// The weight, 1..=256 encoded as 0..=255.
    pub weight: u8,
    /// Whether the dependency is exclusive.
    pub is_exclusive: bool,
}

/// The subset of SETTINGS this connection acts on.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// SETTINGS_INITIAL_WINDOW_SIZE.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_ENABLE_PUSH.
    pub enable_push: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: None,
            enable_push: true,
        }
    }
}

/// The protocol-defined initial flow-control window.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// The protocol-defined initial maximum frame size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// An HTTP/2 error code, carried by RST_STREAM and GOAWAY.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reason(u32);

impl Reason {
    /// Graceful shutdown or an uninteresting reset.
    pub const NO_ERROR: Reason = Reason(0);
    /// The peer violated the protocol.
    pub const PROTOCOL_ERROR: Reason = Reason(1);
    /// An unexpected internal failure.
    pub const INTERNAL_ERROR: Reason = Reason(2);
    /// Flow-control accounting was violated.
    pub const FLOW_CONTROL_ERROR: Reason = Reason(3);
    /// The stream was refused before any work happened.
    pub const REFUSED_STREAM: Reason = Reason(7);
    /// The stream is no longer wanted.
    pub const CANCEL: Reason = Reason(8);
    /// The peer is misbehaving badly enough to slow down.
    pub const ENHANCE_YOUR_CALM: Reason = Reason(11);

    /// The raw error code.
    pub fn code(&self) -> u32 {
        self.0
    }

    /// Wraps a raw error code.
    pub fn from_code(code: u32) -> Reason {
        Reason(code)
    }

    fn name(&self) -> &str {
        match self.0 {
            0 => "NO_ERROR",
            1 => "PROTOCOL_ERROR",
            2 => "INTERNAL_ERROR",
            3 => "FLOW_CONTROL_ERROR",
            7 => "REFUSED_STREAM",
            8 => "CANCEL",
            11 => "ENHANCE_YOUR_CALM",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// A server-push request registered by a handler.
///
/// The connection reserves the promised stream, emits the PUSH_PROMISE,
/// and runs the promised response as a normal exchange.
#[derive(Debug)]
pub struct PushRequest {
    /// The promised request method. GET in almost all cases.
    pub method: Method,
    /// The promised request target.
    pub path: Uri,
    /// Header fields of the promised request.
    pub headers: HeaderMap,
}
