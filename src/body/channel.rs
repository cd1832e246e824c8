//! The request-body channel between a connection and user code.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_channel::{mpsc, oneshot};
use futures_core::Stream;
use futures_util::ready;
use futures_util::stream::FusedStream;
use http::HeaderMap;
use http_body::SizeHint;
use mime::Mime;

use crate::multipart::{MultipartLimits, Parts};

/// Creates the sender/receiver pair for one request body.
///
/// The channel holds a single chunk: a second `try_send_data` before the
/// subscriber drains the first reports the chunk back as rejected, which is
/// what keeps HTTP/2 flow-control credit from being returned for bytes the
/// application never consumed.
pub(crate) fn channel(content_length: Option<u64>) -> (Sender, RequestBody) {
    let (data_tx, data_rx) = mpsc::channel(0);
    let (trailers_tx, trailers_rx) = oneshot::channel();

    let tx = Sender {
        data_tx,
        trailers_tx: Some(trailers_tx),
    };
    let rx = RequestBody {
        data_rx,
        trailers_rx,
        content_length,
    };

    (tx, rx)
}

/// The connection-side sender half of a request body.
pub(crate) struct Sender {
    data_tx: mpsc::Sender<crate::Result<Bytes>>,
    trailers_tx: Option<oneshot::Sender<HeaderMap>>,
}

/// Why a chunk could not be handed to the subscriber.
#[derive(Debug)]
pub(crate) enum Rejected {
    /// The subscriber has not drained the previous chunk yet. The chunk is
    /// handed back; the producer must release it without acknowledging it.
    Overflow(Bytes),
    /// Nobody is subscribed (or the subscriber went away). The chunk is
    /// handed back to be released; it counts as consumed.
    Closed(Bytes),
}

impl Sender {
    /// Tries to hand a chunk to the subscriber.
    pub(crate) fn try_send_data(&mut self, chunk: Bytes) -> Result<(), Rejected> {
        self.data_tx.try_send(Ok(chunk)).map_err(|err| {
            let full = err.is_full();
            let chunk = match err.into_inner() {
                Ok(chunk) => chunk,
                Err(_) => unreachable!("just sent Ok"),
            };
            if full {
                Rejected::Overflow(chunk)
            } else {
                Rejected::Closed(chunk)
            }
        })
    }

    /// Errors the body stream.
    pub(crate) fn send_error(&mut self, err: crate::Error) {
        // clone so the send works even if the buffer slot is taken
        let _ = self.data_tx.clone().try_send(Err(err));
    }

    /// Completes the body, optionally delivering trailers first.
    pub(crate) fn complete(mut self, trailers: Option<HeaderMap>) {
        if let (Some(tx), Some(trailers)) = (self.trailers_tx.take(), trailers) {
            let _ = tx.send(trailers);
        }
        // dropping the data sender terminates the stream
    }

    /// Whether the subscriber has gone away.
    pub(crate) fn is_closed(&self) -> bool {
        self.data_tx.is_closed()
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A lazy, single-subscription request body.
///
/// Chunks arrive as the connection reads them; a slow consumer makes the
/// connection drop chunks (HTTP/1.x) or withhold flow-control credit
/// (HTTP/2). Views exist for url-encoded forms and multipart parts.
#[must_use = "streams do nothing unless polled"]
pub struct RequestBody {
    data_rx: mpsc::Receiver<crate::Result<Bytes>>,
    trailers_rx: oneshot::Receiver<HeaderMap>,
    content_length: Option<u64>,
}

impl RequestBody {
    /// The declared `content-length`, if the request carried one.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Collects the whole body into contiguous bytes.
    pub async fn aggregate(mut self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = futures_util::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Decodes the body as `application/x-www-form-urlencoded` parameters.
    pub fn into_url_encoded(self) -> super::form::UrlEncoded {
        super::form::UrlEncoded::new(self)
    }

    /// Decodes the body as `multipart/form-data` parts.
    ///
    /// Fails when the content type carries no `boundary` parameter.
    pub fn into_multipart(
        self,
        content_type: &Mime,
        limits: MultipartLimits,
    ) -> crate::Result<Parts> {
        Parts::new(self, content_type, limits)
    }

    /// Decodes the body into a value with the given codec.
    pub async fn decode<C: crate::codec::Codec>(self, codec: &C) -> crate::Result<C::Value> {
        codec.decode(Box::pin(self)).await
    }
}

impl Stream for RequestBody {
    type Item = crate::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.data_rx).poll_next(cx)
    }
}

impl http_body::Body for RequestBody {
    type Data = Bytes;
    type Error = crate::Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        Pin::new(&mut self.data_rx).poll_next(cx)
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        match ready!(Pin::new(&mut self.trailers_rx).poll(cx)) {
            Ok(trailers) => Poll::Ready(Ok(Some(trailers))),
            Err(_) => Poll::Ready(Ok(None)),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.data_rx.is_terminated()
    }

    fn size_hint(&self) -> SizeHint {
        self.content_length
            .map(SizeHint::with_exact)
            .unwrap_or_default()
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn chunk_delivered_once() {
        let (mut tx, mut body) = channel(None);
        tx.try_send_data(Bytes::from_static(b"hello")).unwrap();
        let chunk = body.next().await.unwrap().unwrap();
        assert_eq!(chunk, "hello");
    }

    #[test]
    fn overflow_hands_chunk_back() {
        let (mut tx, body) = channel(None);
        tx.try_send_data(Bytes::from_static(b"one")).unwrap();
        match tx.try_send_data(Bytes::from_static(b"two")) {
            Err(Rejected::Overflow(chunk)) => assert_eq!(chunk, "two"),
            other => panic!("expected overflow, got {:?}", other),
        }
        drop(body);
    }

    #[test]
    fn dropped_subscriber_reports_closed() {
        let (mut tx, body) = channel(None);
        drop(body);
        match tx.try_send_data(Bytes::from_static(b"late")) {
            Err(Rejected::Closed(chunk)) => assert_eq!(chunk, "late"),
            other => panic!("expected closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn complete_with_trailers() {
        use http_body::Body as _;

        let (mut tx, mut body) = channel(Some(2));
        tx.try_send_data(Bytes::from_static(b"ok")).unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "1".parse().unwrap());
        tx.complete(Some(trailers));

        assert_eq!(body.next().await.unwrap().unwrap(), "ok");
        assert!(body.next().await.is_none());
        let got = futures_util::future::poll_fn(|cx| Pin::new(&mut body).poll_trailers(cx))
            .await
            .unwrap()
            .expect("trailers");
        assert_eq!(got.get("x-checksum").unwrap(), "1");
    }
}
