//! Request and response bodies.
//!
//! Both directions are single-subscription byte streams with backpressure.
//! The request side is fed by the connection through a bounded channel
//! whose sender either delivers each chunk or reports it back for release;
//! the response side is a set of terminal body variants that the
//! connection drains as a plain stream of [`Bytes`].

use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;

pub(crate) mod channel;
mod form;
mod outgoing;
mod resource;
pub mod sse;

pub use self::channel::RequestBody;
pub use self::form::{Parameter, UrlEncoded};
pub(crate) use self::outgoing::{finish_body, OutBody, Transform};
pub use self::resource::ResourceBody;

/// A boxed stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = crate::Result<Bytes>> + Send + 'static>>;
