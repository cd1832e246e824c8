//! Streaming `multipart/form-data` decoding.
//!
//! [`Parts`] is a lazy stream of [`Part`]s over a request body. Parts
//! arrive strictly in order and only one is active at a time: a part's
//! data sink completes when its terminating boundary is observed. Either
//! the `Parts` stream or the active [`PartBody`] drives the decoding,
//! whichever is polled.

pub(crate) mod decoder;

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use futures_core::Stream;
use futures_util::StreamExt;
use http::HeaderMap;
use mime::Mime;

use crate::body::RequestBody;
use crate::config::ServerConfig;
use crate::error::Multipart as MultipartKind;

use self::decoder::{Decoder, Event, PartHead};

/// The `multipart_max_*` knobs, frozen from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct MultipartLimits {
    /// Most parts one body may contain.
    pub max_parts: usize,
    /// Largest header section one part may carry, in bytes.
    pub max_part_header_bytes: usize,
}

impl Default for MultipartLimits {
    fn default() -> MultipartLimits {
        MultipartLimits {
            max_parts: 256,
            max_part_header_bytes: 8192,
        }
    }
}

impl From<&ServerConfig> for MultipartLimits {
    fn from(config: &ServerConfig) -> MultipartLimits {
        MultipartLimits {
            max_parts: config.multipart_max_parts,
            max_part_header_bytes: config.multipart_max_part_header_bytes,
        }
    }
}

/// A lazy sequence of multipart parts.
#[must_use = "streams do nothing unless polled"]
pub struct Parts {
    inner: Arc<Mutex<Inner>>,
}

impl Parts {
    /// Builds the part stream over a body.
    ///
    /// Fails when the content type carries no `boundary` parameter.
    pub(crate) fn new(
        body: RequestBody,
        content_type: &Mime,
        limits: MultipartLimits,
    ) -> crate::Result<Parts> {
        let boundary = content_type
            .get_param(mime::BOUNDARY)
            .ok_or_else(|| crate::Error::new_multipart(MultipartKind::MissingBoundary))?;
        Ok(Parts {
            inner: Arc::new(Mutex::new(Inner {
                body: Some(body),
                buf: BytesMut::new(),
                decoder: Decoder::new(boundary.as_str(), limits),
                events: VecDeque::new(),
                current: None,
                failure: None,
                finished: false,
                parts_dropped: false,
            })),
        })
    }
}

impl Stream for Parts {
    type Item = crate::Result<Part>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut inner = lock(&self.inner);
        match inner.poll_progress(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                if let Some(Event::PartStart(_)) = inner.events.front() {
                    let head = match inner.events.pop_front() {
                        Some(Event::PartStart(head)) => head,
                        _ => unreachable!("front was a part start"),
                    };
                    let (tx, rx) = mpsc::unbounded();
                    inner.current = Some(tx);
                    drop(inner);
                    return Poll::Ready(Some(Ok(Part {
                        head,
                        body: Some(PartBody {
                            inner: self.inner.clone(),
                            rx,
                        }),
                    })));
                }
                if let Some(err) = inner.failure.take() {
                    return Poll::Ready(Some(Err(err)));
                }
                if inner.finished {
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for Parts {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.parts_dropped = true;
        if inner.current.is_none() {
            // no active part: cancel the subscription eagerly
            inner.body = None;
        }
        // with an active part, decoding continues until that part ends
    }
}

impl fmt::Debug for Parts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Parts")
    }
}

/// One decoded part: headers plus a lazy data stream.
pub struct Part {
    head: PartHead,
    body: Option<PartBody>,
}

impl Part {
    /// The part's field name.
    pub fn name(&self) -> &str {
        &self.head.name
    }

    /// The filename, for file parts.
    pub fn filename(&self) -> Option<&str> {
        self.head.filename.as_deref()
    }

    /// The part's content type, when declared.
    pub fn content_type(&self) -> Option<&Mime> {
        self.head.content_type.as_ref()
    }

    /// All header fields of the part.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Takes the part's body stream. Single subscription, like a request
    /// body.
    pub fn body(&mut self) -> Option<PartBody> {
        self.body.take()
    }

    /// Decodes the part's body into a value with the given codec.
    pub async fn decode<C: crate::codec::Codec>(mut self, codec: &C) -> crate::Result<C::Value> {
        let body = self
            .body()
            .ok_or_else(crate::Error::new_closed)?;
        codec.decode(Box::pin(body)).await
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("name", &self.head.name)
            .field("filename", &self.head.filename)
            .finish()
    }
}

/// The data sink view of one part.
#[must_use = "streams do nothing unless polled"]
pub struct PartBody {
    inner: Arc<Mutex<Inner>>,
    rx: mpsc::UnboundedReceiver<crate::Result<Bytes>>,
}

impl PartBody {
    /// Collects the whole part into contiguous bytes.
    pub async fn aggregate(mut self) -> crate::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl Stream for PartBody {
    type Item = crate::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // already-routed data first
        if let Poll::Ready(item) = self.rx.poll_next_unpin(cx) {
            return Poll::Ready(item);
        }
        // otherwise this poll drives the shared decoding
        {
            let mut inner = lock(&self.inner);
            match inner.poll_progress(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {}
            }
        }
        self.rx.poll_next_unpin(cx)
    }
}

impl fmt::Debug for PartBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PartBody")
    }
}

// ===== impl Inner =====

struct Inner {
    body: Option<RequestBody>,
    buf: BytesMut,
    decoder: Decoder,
    events: VecDeque<Event>,
    current: Option<mpsc::UnboundedSender<crate::Result<Bytes>>>,
    failure: Option<crate::Error>,
    finished: bool,
    parts_dropped: bool,
}

fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
    inner.lock().expect("multipart state poisoned")
}

impl Inner {
    /// Pumps body bytes through the decoder and routes events, stopping at
    /// the next part start (left queued), the end, a failure, or `Pending`.
    fn poll_progress(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            while let Some(event) = self.events.front() {
                if matches!(event, Event::PartStart(_)) {
                    return Poll::Ready(());
                }
                let event = self.events.pop_front().expect("front exists");
                self.route(event);
            }
            if self.finished || self.failure.is_some() {
                return Poll::Ready(());
            }

            let body = match self.body {
                Some(ref mut body) => body,
                None => return Poll::Ready(()),
            };
            match Pin::new(body).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                    let mut events = Vec::new();
                    let result = self.decoder.decode(&mut self.buf, &mut events);
                    self.events.extend(events);
                    if let Err(err) = result {
                        self.fail(err);
                    }
                }
                Poll::Ready(Some(Err(err))) => self.fail(err),
                Poll::Ready(None) => {
                    self.body = None;
                    match self.decoder.finish() {
                        Ok(()) => self.finished = true,
                        Err(err) => self.fail(err),
                    }
                }
            }
        }
    }

    fn route(&mut self, event: Event) {
        match event {
            Event::Data(chunk) => {
                if let Some(ref tx) = self.current {
                    // an unsubscribed part releases its bytes
                    let _ = tx.unbounded_send(Ok(chunk));
                }
            }
            Event::PartEnd => {
                self.current = None;
                if self.parts_dropped {
                    // deferred cancel: the awaited part has ended
                    self.body = None;
                    self.finished = true;
                }
            }
            Event::PartStart(_) => unreachable!("part starts are consumed by the parts stream"),
        }
    }

    fn fail(&mut self, err: crate::Error) {
        debug!("multipart decode failed: {}", err);
        if let Some(tx) = self.current.take() {
            let _ = tx.unbounded_send(Err(err));
            self.failure = Some(crate::Error::new_multipart(MultipartKind::MalformedBody));
        } else {
            self.failure = Some(err);
        }
        self.body = None;
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::channel;
    use futures_util::StreamExt;

    fn form_data_mime() -> Mime {
        "multipart/form-data; boundary=----X".parse().unwrap()
    }

    fn feed(
        input: &'static [u8],
    ) -> Parts {
        let (mut tx, body) = channel::channel(None);
        tx.try_send_data(Bytes::from_static(input)).unwrap();
        tx.complete(None);
        Parts::new(body, &form_data_mime(), MultipartLimits::default()).unwrap()
    }

    #[tokio::test]
    async fn one_part_streams_its_data() {
        let mut parts = feed(
            b"------X\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\nhello\r\n------X--",
        );
        let mut part = parts.next().await.unwrap().unwrap();
        assert_eq!(part.name(), "n");
        assert!(part.filename().is_none());
        let data = part.body().unwrap().aggregate().await.unwrap();
        assert_eq!(data, "hello");
        assert!(parts.next().await.is_none());
    }

    #[tokio::test]
    async fn parts_can_be_skipped() {
        let mut parts = feed(
            b"------X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
              ------X\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\n2\r\n\
              ------X--",
        );
        // never read part a's body
        let part_a = parts.next().await.unwrap().unwrap();
        assert_eq!(part_a.name(), "a");
        drop(part_a);
        let mut part_b = parts.next().await.unwrap().unwrap();
        assert_eq!(part_b.name(), "b");
        assert_eq!(part_b.body().unwrap().aggregate().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn missing_boundary_param() {
        let (_tx, body) = channel::channel(None);
        let mime: Mime = "multipart/form-data".parse().unwrap();
        let err = Parts::new(body, &mime, MultipartLimits::default()).unwrap_err();
        assert!(err.is_multipart());
    }

    #[tokio::test]
    async fn malformed_body_errors_the_stream() {
        let mut parts = feed(b"not a multipart body at all");
        let err = parts.next().await.unwrap().unwrap_err();
        assert!(err.is_multipart() || err.is_parse());
    }

    #[tokio::test]
    async fn active_part_survives_parts_drop() {
        let mut parts = feed(
            b"------X\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\npayload\r\n------X--",
        );
        let mut part = parts.next().await.unwrap().unwrap();
        let body = part.body().unwrap();
        drop(parts);
        // decoding continues until this part's boundary
        assert_eq!(body.aggregate().await.unwrap(), "payload");
    }
}
