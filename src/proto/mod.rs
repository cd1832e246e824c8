//! Per-protocol connection state machines.

pub mod h1;
pub mod h2;

use http::{HeaderMap, StatusCode};

/// The head of an outbound response, ready for the wire encoder.
#[derive(Debug)]
pub struct ResponseHead {
    /// The response status.
    pub status: StatusCode,
    /// The response header multimap.
    pub headers: HeaderMap,
}

/// The lifecycle of a connection as a whole.
///
/// `Closing` is entered by shutdown (graceful or not) or a fatal error; new
/// inbound requests are dropped there. In `Closed` everything is inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Open,
    Closing,
    Closed,
}
