#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # estuary
//!
//! estuary is the connection core of a reactive HTTP server: the
//! per-connection state machines that ingest framed wire messages, drive
//! request/response exchanges, enforce ordering, handle errors, and
//! optionally upgrade to WebSocket.
//!
//! Two protocol variants coexist and share one exchange lifecycle:
//!
//! - [`Http1Connection`](proto::h1::Http1Connection): pipelined, one
//!   in-flight response at a time, strict FIFO write ordering.
//! - [`Http2Connection`](proto::h2::Http2Connection): multiplexed streams
//!   with flow control.
//!
//! ## "Low-level"
//!
//! estuary is a building block, not a server framework. Byte-level parsing
//! and encoding live behind the [`Channel`](channel::Channel) seam: a
//! connection consumes and produces *framed* protocol messages, never raw
//! bytes. Routing, content negotiation and dependency wiring are equally
//! out of scope; user code plugs in through the
//! [`Controller`](service::Controller) contract.
//!
//! ## Optional features
//!
//! - `ws-deflate`: negotiate the deflate WebSocket extensions
//!   (`permessage-deflate` per RFC 7692 and the draft `deflate-frame`).

#[macro_use]
extern crate tracing;

pub mod body;
pub mod channel;
pub mod codec;
pub mod config;
mod common;
mod error;
pub mod exchange;
#[cfg(test)]
mod mock;
pub mod multipart;
pub mod proto;
pub mod service;
pub mod ws;

mod request;
mod response;

pub use crate::config::ServerConfig;
pub use crate::error::{Error, HttpError, Result};
pub use crate::request::{Request, RequestHeaders};
pub use crate::response::{Response, ResponseBody, ResponseHeaders};

pub use http::{header, HeaderMap, Method, StatusCode, Uri, Version};
