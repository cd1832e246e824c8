//! The mutable-until-written response side of an exchange.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_core::Stream;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use mime::Mime;

use crate::body::sse::{Event, SseBody};
use crate::body::{BodyStream, OutBody};
use crate::common;

/// One HTTP response under construction.
///
/// The handle is shared between the exchange handler and the connection.
/// Everything is mutable until the headers leave the outbound encoder;
/// after that, [`Response::headers`] fails and body selection is inert.
#[derive(Clone)]
pub struct Response {
    inner: Arc<ResponseCell>,
}

pub(crate) struct ResponseCell {
    written: AtomicBool,
    state: Mutex<ResponseState>,
}

pub(crate) struct ResponseState {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: OutBody,
    pub(crate) transforms: Vec<crate::body::Transform>,
    pub(crate) trailers: Option<HeaderMap>,
    pub(crate) ws: Option<crate::ws::Registration>,
    pub(crate) pushes: Vec<crate::proto::h2::PushRequest>,
}

impl Default for ResponseState {
    fn default() -> ResponseState {
        ResponseState {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: OutBody::Unset,
            transforms: Vec::new(),
            trailers: None,
            ws: None,
            pushes: Vec::new(),
        }
    }
}

impl Response {
    pub(crate) fn new() -> (Response, Arc<ResponseCell>) {
        let cell = Arc::new(ResponseCell {
            written: AtomicBool::new(false),
            state: Mutex::new(ResponseState::default()),
        });
        (
            Response {
                inner: cell.clone(),
            },
            cell,
        )
    }

    pub(crate) fn from_cell(cell: Arc<ResponseCell>) -> Response {
        Response { inner: cell }
    }

    pub(crate) fn inner(&self) -> &Arc<ResponseCell> {
        &self.inner
    }

    /// Opens the headers for mutation.
    ///
    /// Fails once the headers have been written to the wire.
    pub fn headers(&self) -> crate::Result<ResponseHeaders<'_>> {
        if self.inner.is_written() {
            return Err(crate::Error::new_headers_written());
        }
        Ok(ResponseHeaders {
            guard: self.inner.lock(),
        })
    }

    /// Opens the body for terminal selection.
    pub fn body(&self) -> ResponseBody<'_> {
        ResponseBody { cell: &self.inner }
    }

    /// Whether the headers have already left the encoder.
    pub fn is_written(&self) -> bool {
        self.inner.is_written()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("written", &self.inner.is_written())
            .finish()
    }
}

impl ResponseCell {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().expect("response state poisoned")
    }

    pub(crate) fn is_written(&self) -> bool {
        self.written.load(Ordering::Acquire)
    }

    /// Latches the written flag; returns false if it already was.
    pub(crate) fn mark_written(&self) -> bool {
        !self.written.swap(true, Ordering::AcqRel)
    }

    /// Takes the accumulated state, leaving defaults behind.
    pub(crate) fn take_state(&self) -> ResponseState {
        std::mem::take(&mut *self.lock())
    }
}

impl fmt::Debug for ResponseCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCell")
            .field("written", &self.is_written())
            .finish()
    }
}

impl fmt::Debug for ResponseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseState")
            .field("status", &self.status)
            .field("body", &self.body)
            .finish()
    }
}

// ===== impl ResponseHeaders =====

/// Mutable access to the response status and header multimap.
///
/// Obtained through [`Response::headers`]; the fact that it could be
/// obtained guarantees the headers are not on the wire yet.
pub struct ResponseHeaders<'a> {
    guard: MutexGuard<'a, ResponseState>,
}

impl<'a> ResponseHeaders<'a> {
    /// Sets the response status.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.guard.status = status;
        self
    }

    /// Replaces all values of a header.
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.guard.headers.insert(name, value);
        self
    }

    /// Appends a header value, preserving earlier ones.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.guard.headers.append(name, value);
        self
    }

    /// Removes a header entirely.
    pub fn remove(&mut self, name: HeaderName) -> &mut Self {
        self.guard.headers.remove(name);
        self
    }

    /// Sets the `content-type`.
    pub fn content_type(&mut self, mime: &Mime) -> &mut Self {
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            self.guard.headers.insert(header::CONTENT_TYPE, value);
        }
        self
    }

    /// Sets the `content-length`.
    pub fn content_length(&mut self, len: u64) -> &mut Self {
        self.guard
            .headers
            .insert(header::CONTENT_LENGTH, common::content_length_value(len));
        self
    }

    /// Reads a header back.
    pub fn get(&self, name: HeaderName) -> Option<&HeaderValue> {
        self.guard.headers.get(name)
    }
}

impl<'a> fmt::Debug for ResponseHeaders<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHeaders")
            .field("status", &self.guard.status)
            .finish()
    }
}

// ===== impl ResponseBody =====

/// Terminal body selection for a response.
///
/// Only the first terminal selection takes; later calls are no-ops, except
/// [`empty`](ResponseBody::empty), which is idempotent by nature.
pub struct ResponseBody<'a> {
    cell: &'a ResponseCell,
}

impl<'a> ResponseBody<'a> {
    fn select(&self, body: OutBody) {
        if self.cell.is_written() {
            return;
        }
        let mut state = self.cell.lock();
        if !state.body.is_set() {
            state.body = body;
        }
    }

    /// No body at all.
    pub fn empty(&self) {
        self.select(OutBody::Empty);
    }

    /// A complete in-memory body.
    pub fn full<B: Into<Bytes>>(&self, bytes: B) {
        self.select(OutBody::Full(bytes.into()));
    }

    /// A complete text body; sets `text/plain` when no content type was
    /// chosen.
    pub fn string<S: Into<String>>(&self, text: S) {
        if self.cell.is_written() {
            return;
        }
        let mut state = self.cell.lock();
        if state.body.is_set() {
            return;
        }
        if !state.headers.contains_key(header::CONTENT_TYPE) {
            state.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
        }
        state.body = OutBody::Full(Bytes::from(text.into()));
    }

    /// A streaming body.
    pub fn stream<S>(&self, stream: S)
    where
        S: Stream<Item = crate::Result<Bytes>> + Send + 'static,
    {
        self.select(OutBody::Stream(Box::pin(stream)));
    }

    /// A file-backed body, opened lazily.
    pub fn resource<P: Into<PathBuf>>(&self, path: P) {
        self.select(OutBody::Resource(path.into()));
    }

    /// A Server-Sent Events body; sets `text/event-stream` when no content
    /// type was chosen.
    pub fn sse<S>(&self, events: S)
    where
        S: Stream<Item = Event> + Send + 'static,
    {
        if self.cell.is_written() {
            return;
        }
        let mut state = self.cell.lock();
        if state.body.is_set() {
            return;
        }
        if !state.headers.contains_key(header::CONTENT_TYPE) {
            state.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
        }
        state.body = OutBody::Stream(Box::pin(SseBody::new(events)));
    }

    /// Encodes a value through a codec; sets the codec's first media type
    /// when no content type was chosen.
    pub fn encode<C: crate::codec::Codec>(&self, codec: &C, value: C::Value) -> crate::Result<()> {
        let stream = codec.encode(value)?;
        if self.cell.is_written() {
            return Ok(());
        }
        let mut state = self.cell.lock();
        if state.body.is_set() {
            return Ok(());
        }
        if !state.headers.contains_key(header::CONTENT_TYPE) {
            if let Some(mime) = codec.media_types().first() {
                if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                    state.headers.insert(header::CONTENT_TYPE, value);
                }
            }
        }
        state.body = OutBody::Stream(stream);
        Ok(())
    }

    /// Sets trailers emitted after the final body chunk.
    pub fn trailers(&self, trailers: HeaderMap) {
        if self.cell.is_written() {
            return;
        }
        self.cell.lock().trailers = Some(trailers);
    }

    /// Wraps the outbound publisher. Transforms stack; the last installed
    /// runs outermost. Used by before/after hooks and access logging.
    pub fn transform<F>(&self, transform: F)
    where
        F: FnOnce(BodyStream) -> BodyStream + Send + 'static,
    {
        if self.cell.is_written() {
            return;
        }
        self.cell.lock().transforms.push(Box::new(transform));
    }
}

impl<'a> fmt::Debug for ResponseBody<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody")
    }
}
