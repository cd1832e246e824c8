//! HTTP/2 framed messages and the multiplexed connection.

pub(crate) mod conn;
pub(crate) mod flow;
pub mod frame;
pub(crate) mod stream;

pub use self::conn::Http2Connection;
pub use self::frame::{
    DataFrame, Frame, HeadersFrame, PushPromiseFrame, PushRequest, Reason, Settings,
    StreamDependency, StreamId, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE,
};
