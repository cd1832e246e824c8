//! Terminal response body variants and their reduction to a wire stream.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use futures_util::stream;
use http::HeaderMap;

use super::{BodyStream, ResourceBody};

/// A transformation wrapped around the outbound publisher, installed by
/// before/after hooks such as access logging.
pub(crate) type Transform = Box<dyn FnOnce(BodyStream) -> BodyStream + Send + 'static>;

/// The terminal body a response was configured with.
///
/// Exactly one terminal variant may be selected; later selections are
/// no-ops. `Unset` sends like `Empty`.
pub(crate) enum OutBody {
    Unset,
    Empty,
    Full(Bytes),
    Stream(BodyStream),
    Resource(PathBuf),
}

impl OutBody {
    pub(crate) fn is_set(&self) -> bool {
        !matches!(self, OutBody::Unset)
    }
}

impl fmt::Debug for OutBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutBody::Unset => f.write_str("Unset"),
            OutBody::Empty => f.write_str("Empty"),
            OutBody::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            OutBody::Stream(_) => f.write_str("Stream"),
            OutBody::Resource(p) => f.debug_tuple("Resource").field(p).finish(),
        }
    }
}

/// A body reduced to what the connection needs to write it.
pub(crate) struct FinishedBody {
    /// Known up front only when nothing can change the byte count anymore.
    pub(crate) content_length: Option<u64>,
    /// `None` means no body frames at all.
    pub(crate) stream: Option<BodyStream>,
    pub(crate) trailers: Option<HeaderMap>,
}

/// Reduces a configured body to a single outbound stream, applying the
/// transform chain outermost-last.
pub(crate) fn finish_body(
    body: OutBody,
    transforms: Vec<Transform>,
    trailers: Option<HeaderMap>,
) -> FinishedBody {
    let (content_length, stream) = match body {
        OutBody::Unset | OutBody::Empty => (Some(0), None),
        OutBody::Full(bytes) => {
            let len = bytes.len() as u64;
            (Some(len), Some(Box::pin(stream::iter(vec![Ok(bytes)])) as BodyStream))
        }
        OutBody::Stream(stream) => (None, Some(stream)),
        OutBody::Resource(path) => (None, Some(Box::pin(ResourceBody::open(path)) as BodyStream)),
    };

    if transforms.is_empty() {
        return FinishedBody {
            content_length,
            stream,
            trailers,
        };
    }

    // A transform may change the byte count, so the length is no longer
    // known, and even an empty body must flow through the chain.
    let mut wrapped = stream.unwrap_or_else(|| Box::pin(stream::empty()) as BodyStream);
    for transform in transforms {
        wrapped = transform(wrapped);
    }
    FinishedBody {
        content_length: None,
        stream: Some(wrapped),
        trailers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn full_body_knows_its_length() {
        let finished = finish_body(OutBody::Full(Bytes::from_static(b"abc")), Vec::new(), None);
        assert_eq!(finished.content_length, Some(3));
        let mut stream = finished.stream.expect("stream");
        assert_eq!(stream.next().await.unwrap().unwrap(), "abc");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn transform_wraps_and_forgets_length() {
        let finished = finish_body(
            OutBody::Full(Bytes::from_static(b"abc")),
            vec![Box::new(|s: BodyStream| {
                Box::pin(s.map(|chunk| chunk.map(|_| Bytes::from_static(b"xxxx")))) as BodyStream
            })],
            None,
        );
        assert_eq!(finished.content_length, None);
        let mut stream = finished.stream.expect("stream");
        assert_eq!(stream.next().await.unwrap().unwrap(), "xxxx");
    }

    #[test]
    fn unset_sends_like_empty() {
        let finished = finish_body(OutBody::Unset, Vec::new(), None);
        assert_eq!(finished.content_length, Some(0));
        assert!(finished.stream.is_none());
    }
}
