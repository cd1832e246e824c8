//! The pluggable media-type codec contract.
//!
//! Codecs are external collaborators: this crate never converts values to
//! bytes itself, it only routes byte streams. A codec declares the media
//! types it understands, encodes a value into a body stream, and decodes a
//! body stream back into a value. Request bodies, response bodies and
//! multipart parts all accept one.

use std::future::Future;
use std::pin::Pin;

use mime::Mime;

use crate::body::BodyStream;

/// A value decoded from, or encoded into, an HTTP message body.
pub trait Codec {
    /// The value type this codec converts.
    type Value;

    /// Media types this codec can convert, most specific first.
    fn media_types(&self) -> Vec<Mime>;

    /// Encodes a value into a lazy byte stream.
    fn encode(&self, value: Self::Value) -> crate::Result<BodyStream>;

    /// Decodes a byte stream into a value.
    fn decode(
        &self,
        body: BodyStream,
    ) -> Pin<Box<dyn Future<Output = crate::Result<Self::Value>> + Send + 'static>>;
}
