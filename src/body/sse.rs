//! Server-Sent Events bodies.
//!
//! An SSE body is a stream of [`Event`]s encoded to the
//! `text/event-stream` wire format: one `event:`/`id:`/`retry:` line each
//! when present, one `data:` line per line of data, a blank line as the
//! event terminator. Comment-only events keep the connection warm.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures_core::Stream;
use futures_util::ready;
use pin_project_lite::pin_project;

/// One server-sent event.
#[derive(Debug, Default, Clone)]
pub struct Event {
    id: Option<String>,
    event: Option<String>,
    data: Option<String>,
    retry: Option<u64>,
    comment: Option<String>,
}

impl Event {
    /// An empty event.
    pub fn new() -> Event {
        Event::default()
    }

    /// Sets the `id:` field.
    pub fn id<S: Into<String>>(mut self, id: S) -> Event {
        self.id = Some(id.into());
        self
    }

    /// Sets the `event:` (type) field.
    pub fn event<S: Into<String>>(mut self, event: S) -> Event {
        self.event = Some(event.into());
        self
    }

    /// Sets the data. Embedded newlines become multiple `data:` lines.
    pub fn data<S: Into<String>>(mut self, data: S) -> Event {
        self.data = Some(data.into());
        self
    }

    /// Sets the `retry:` reconnection delay, in milliseconds.
    pub fn retry(mut self, millis: u64) -> Event {
        self.retry = Some(millis);
        self
    }

    /// Sets a comment line, sent before the fields.
    pub fn comment<S: Into<String>>(mut self, comment: S) -> Event {
        self.comment = Some(comment.into());
        self
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        if let Some(ref comment) = self.comment {
            for line in comment.split('\n') {
                buf.put_slice(b": ");
                buf.put_slice(line.as_bytes());
                buf.put_u8(b'\n');
            }
        }
        if let Some(ref id) = self.id {
            buf.put_slice(b"id: ");
            buf.put_slice(id.as_bytes());
            buf.put_u8(b'\n');
        }
        if let Some(ref event) = self.event {
            buf.put_slice(b"event: ");
            buf.put_slice(event.as_bytes());
            buf.put_u8(b'\n');
        }
        if let Some(retry) = self.retry {
            let mut itoa_buf = itoa::Buffer::new();
            buf.put_slice(b"retry: ");
            buf.put_slice(itoa_buf.format(retry).as_bytes());
            buf.put_u8(b'\n');
        }
        if let Some(ref data) = self.data {
            for line in data.split('\n') {
                buf.put_slice(b"data: ");
                buf.put_slice(line.as_bytes());
                buf.put_u8(b'\n');
            }
        }
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

pin_project! {
    /// A body stream encoding each [`Event`] to the wire format.
    ///
    /// Wraps any event stream, pinned in place; this is what
    /// [`ResponseBody::sse`](crate::ResponseBody::sse) drains.
    #[must_use = "streams do nothing unless polled"]
    pub struct SseBody<S> {
        #[pin]
        events: S,
    }
}

impl<S> SseBody<S> {
    /// Wraps an event stream.
    pub fn new(events: S) -> SseBody<S> {
        SseBody { events }
    }
}

impl<S> Stream for SseBody<S>
where
    S: Stream<Item = Event>,
{
    type Item = crate::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.events.poll_next(cx)) {
            Some(event) => Poll::Ready(Some(Ok(event.encode()))),
            None => Poll::Ready(None),
        }
    }
}

impl<S> fmt::Debug for SseBody<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SseBody")
    }
}
