//! WebSocket upgrade and session plumbing (HTTP/1.x only).
//!
//! The upgrade is a protocol switch: once the handshake succeeds the
//! HTTP exchange's request and response are disposed, the channel pipeline
//! is re-plumbed to carry WebSocket frames, and the user's WebSocket
//! handler takes over through a [`WebSocketExchange`]. Byte-level framing
//! (masking, lengths, deflate transforms) stays in the channel; this
//! module assembles messages, answers control frames, and runs the closing
//! handshake.

pub(crate) mod deflate;
pub(crate) mod handshake;

pub use self::deflate::DeflateParams;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use futures_util::StreamExt;
use tokio::time::Sleep;

use crate::response::Response;
use crate::service::Completion;

/// One WebSocket frame, already parsed by the channel pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The frame opcode.
    pub opcode: OpCode,
    /// Whether this frame finishes its message.
    pub fin: bool,
    /// Whether the payload arrived masked. Clients must mask.
    pub masked: bool,
    /// Whether the RSV1 (compression) bit was set.
    pub compressed: bool,
    /// The unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    pub(crate) fn data(opcode: OpCode, payload: Bytes) -> Frame {
        Frame {
            opcode,
            fin: true,
            masked: false,
            compressed: false,
            payload,
        }
    }

    pub(crate) fn close(code: u16, reason: &str) -> Frame {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Frame::data(OpCode::Close, payload.freeze())
    }
}

/// A WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continues a fragmented message.
    Continuation,
    /// A text message (or its first fragment).
    Text,
    /// A binary message (or its first fragment).
    Binary,
    /// Closing handshake.
    Close,
    /// Keep-alive probe.
    Ping,
    /// Keep-alive answer.
    Pong,
}

/// An assembled WebSocket message, as seen by the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A complete text message.
    Text(String),
    /// A complete binary message.
    Binary(Bytes),
    /// A ping; the session answers pongs itself, this is informational.
    Ping(Bytes),
    /// A pong.
    Pong(Bytes),
    /// The peer started (or answered) the closing handshake.
    Close(Option<CloseReason>),
}

/// Why a WebSocket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// The close code.
    pub code: u16,
    /// An optional human-readable reason.
    pub reason: String,
}

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// The peer violated the protocol.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// A text message was not valid UTF-8.
pub const CLOSE_INVALID_DATA: u16 = 1007;
/// A frame exceeded the configured maximum size.
pub const CLOSE_TOO_BIG: u16 = 1009;
/// The handler failed.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// What the channel pipeline needs to know to speak WebSocket.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    /// Largest accepted frame payload.
    pub max_frame_size: usize,
    /// Tolerate a bad masking bit instead of failing.
    pub allow_mask_mismatch: bool,
    /// How long the opening handshake may take.
    pub handshake_timeout: Duration,
    /// The negotiated deflate extension, if any.
    pub deflate: Option<DeflateParams>,
}

// ===== impl Registration =====

type WsHandler = Box<dyn FnOnce(WebSocketExchange) -> Completion + Send + 'static>;
type WsFallback = Box<dyn FnOnce(&Response) + Send + 'static>;

/// A pending WebSocket registered on an exchange by its handler.
///
/// Carried inside the response cell until the exchange completes, at which
/// point the connection runs the handshake instead of sending an HTTP
/// response.
pub struct Registration {
    pub(crate) subprotocols: Vec<String>,
    pub(crate) handler: WsHandler,
    pub(crate) fallback: Option<WsFallback>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("subprotocols", &self.subprotocols)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

// ===== impl WebSocketExchange =====

/// The message-level exchange handed to a WebSocket handler.
pub struct WebSocketExchange {
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Message>,
    subprotocol: Option<String>,
}

impl WebSocketExchange {
    /// The subprotocol the handshake settled on, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Receives the next message. `None` once the session is closing.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.next().await
    }

    /// Sends a message. Fails once the session is gone.
    pub fn send(&mut self, message: Message) -> crate::Result<()> {
        self.outbound
            .unbounded_send(message)
            .map_err(|_| crate::Error::new_closed())
    }
}

impl fmt::Debug for WebSocketExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketExchange")
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

// ===== impl Session =====

/// The connection-side driver of an open WebSocket.
pub(crate) struct Session {
    handler: Option<Completion>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    partial: Option<(OpCode, BytesMut)>,
    max_frame_size: usize,
    allow_mask_mismatch: bool,
    close_sent: bool,
    close_received: bool,
    close_timeout: Duration,
    close_timer: Option<Pin<Box<Sleep>>>,
}

impl Session {
    /// Opens a session: builds the exchange, starts the handler.
    pub(crate) fn open(
        handler: WsHandler,
        subprotocol: Option<String>,
        max_frame_size: usize,
        allow_mask_mismatch: bool,
        close_timeout: Duration,
    ) -> Session {
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let (outbound_tx, outbound_rx) = mpsc::unbounded();
        let exchange = WebSocketExchange {
            inbound: inbound_rx,
            outbound: outbound_tx,
            subprotocol,
        };
        Session {
            handler: Some(handler(exchange)),
            inbound_tx,
            outbound_rx,
            partial: None,
            max_frame_size,
            allow_mask_mismatch,
            close_sent: false,
            close_received: false,
            close_timeout,
            close_timer: None,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_sent && self.close_received
    }

    /// Ingests one frame, pushing any frames to answer with.
    pub(crate) fn on_frame(&mut self, frame: Frame, out: &mut Vec<Frame>) -> crate::Result<()> {
        if !frame.masked && !self.allow_mask_mismatch {
            debug!("unmasked client frame");
            self.begin_close(CLOSE_PROTOCOL_ERROR, "unmasked frame", out);
            return Err(crate::Error::new_ws_corrupted_frame());
        }
        if frame.payload.len() > self.max_frame_size {
            debug!("frame of {} bytes exceeds limit", frame.payload.len());
            self.begin_close(CLOSE_TOO_BIG, "frame too big", out);
            return Err(crate::Error::new_ws_corrupted_frame());
        }

        match frame.opcode {
            OpCode::Ping => {
                if !self.close_sent {
                    out.push(Frame::data(OpCode::Pong, frame.payload.clone()));
                }
                let _ = self.inbound_tx.unbounded_send(Message::Ping(frame.payload));
            }
            OpCode::Pong => {
                let _ = self.inbound_tx.unbounded_send(Message::Pong(frame.payload));
            }
            OpCode::Close => {
                self.close_received = true;
                let reason = parse_close(&frame.payload);
                if !self.close_sent {
                    let code = reason.as_ref().map(|r| r.code).unwrap_or(CLOSE_NORMAL);
                    out.push(Frame::close(code, ""));
                    self.close_sent = true;
                }
                let _ = self.inbound_tx.unbounded_send(Message::Close(reason));
                self.inbound_tx.close_channel();
            }
            OpCode::Text | OpCode::Binary => {
                if self.partial.is_some() {
                    self.begin_close(CLOSE_PROTOCOL_ERROR, "interleaved message", out);
                    return Err(crate::Error::new_ws_corrupted_frame());
                }
                if frame.fin {
                    self.deliver(frame.opcode, frame.payload, out)?;
                } else {
                    self.partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
            OpCode::Continuation => {
                match self.partial.take() {
                    Some((opcode, mut buf)) => {
                        buf.extend_from_slice(&frame.payload);
                        if buf.len() > self.max_frame_size {
                            self.begin_close(CLOSE_TOO_BIG, "message too big", out);
                            return Err(crate::Error::new_ws_corrupted_frame());
                        }
                        if frame.fin {
                            self.deliver(opcode, buf.freeze(), out)?;
                        } else {
                            self.partial = Some((opcode, buf));
                        }
                    }
                    None => {
                        self.begin_close(CLOSE_PROTOCOL_ERROR, "stray continuation", out);
                        return Err(crate::Error::new_ws_corrupted_frame());
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, opcode: OpCode, payload: Bytes, out: &mut Vec<Frame>) -> crate::Result<()> {
        let message = match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => Message::Text(text),
                Err(_) => {
                    self.begin_close(CLOSE_INVALID_DATA, "invalid utf-8", out);
                    return Err(crate::Error::new_ws_corrupted_frame());
                }
            },
            OpCode::Binary => Message::Binary(payload),
            _ => unreachable!("deliver only sees data opcodes"),
        };
        let _ = self.inbound_tx.unbounded_send(message);
        Ok(())
    }

    /// Drives the handler and the outbound queue. Ready when the session
    /// has fully closed (or the close handshake timed out).
    pub(crate) fn poll(
        &mut self,
        cx: &mut Context<'_>,
        out: &mut Vec<Frame>,
    ) -> Poll<crate::Result<()>> {
        if let Some(mut fut) = self.handler.take() {
            match fut.as_mut().poll(cx) {
                Poll::Pending => self.handler = Some(fut),
                Poll::Ready(Ok(())) => {
                    trace!("ws handler complete");
                    self.begin_close(CLOSE_NORMAL, "", out);
                }
                Poll::Ready(Err(err)) => {
                    debug!("ws handler error: {}", err);
                    self.begin_close(CLOSE_INTERNAL_ERROR, "", out);
                }
            }
        }

        loop {
            match self.outbound_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(message)) if !self.close_sent => match message {
                    Message::Text(text) => {
                        out.push(Frame::data(OpCode::Text, Bytes::from(text)))
                    }
                    Message::Binary(data) => out.push(Frame::data(OpCode::Binary, data)),
                    Message::Ping(data) => out.push(Frame::data(OpCode::Ping, data)),
                    Message::Pong(data) => out.push(Frame::data(OpCode::Pong, data)),
                    Message::Close(reason) => {
                        let (code, text) = match reason {
                            Some(r) => (r.code, r.reason),
                            None => (CLOSE_NORMAL, String::new()),
                        };
                        out.push(Frame::close(code, &text));
                        self.close_sent = true;
                        self.arm_close_timer();
                    }
                },
                Poll::Ready(Some(_)) => {} // already closing, drop
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        if self.is_closed() {
            return Poll::Ready(Ok(()));
        }
        if self.close_sent {
            if let Some(ref mut timer) = self.close_timer {
                if timer.as_mut().poll(cx).is_ready() {
                    debug!("ws close handshake timed out");
                    return Poll::Ready(Err(crate::Error::new_ws_close_timeout()));
                }
            }
        }
        Poll::Pending
    }

    /// Cancels the session from the connection side.
    ///
    /// With a cause the peer sees an internal error, without one a normal
    /// close.
    pub(crate) fn cancel(&mut self, with_cause: bool, out: &mut Vec<Frame>) {
        let code = if with_cause {
            CLOSE_INTERNAL_ERROR
        } else {
            CLOSE_NORMAL
        };
        self.begin_close(code, "", out);
        self.handler = None;
    }

    fn begin_close(&mut self, code: u16, reason: &str, out: &mut Vec<Frame>) {
        if !self.close_sent {
            out.push(Frame::close(code, reason));
            self.close_sent = true;
            self.arm_close_timer();
        }
    }

    fn arm_close_timer(&mut self) {
        if self.close_timer.is_none() {
            self.close_timer = Some(Box::pin(tokio::time::sleep(self.close_timeout)));
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("close_sent", &self.close_sent)
            .field("close_received", &self.close_received)
            .finish()
    }
}

fn parse_close(payload: &[u8]) -> Option<CloseReason> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some(CloseReason { code, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::task::noop_waker_ref;

    fn masked(mut frame: Frame) -> Frame {
        frame.masked = true;
        frame
    }

    fn session() -> Session {
        Session::open(
            Box::new(|_exchange| Box::pin(futures_util::future::pending())),
            None,
            1024,
            false,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut s = session();
        let mut out = Vec::new();
        s.on_frame(
            masked(Frame::data(OpCode::Ping, Bytes::from_static(b"hi"))),
            &mut out,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, OpCode::Pong);
        assert_eq!(out[0].payload, "hi");
    }

    #[tokio::test]
    async fn unmasked_frame_is_corrupted() {
        let mut s = session();
        let mut out = Vec::new();
        let err = s
            .on_frame(Frame::data(OpCode::Text, Bytes::from_static(b"x")), &mut out)
            .unwrap_err();
        assert!(err.is_ws());
        // a protocol-error close goes out
        assert_eq!(out[0].opcode, OpCode::Close);
    }

    #[test]
    fn fragments_reassemble() {
        let mut s = session();
        let mut out = Vec::new();
        let mut first = masked(Frame::data(OpCode::Text, Bytes::from_static(b"hel")));
        first.fin = false;
        s.on_frame(first, &mut out).unwrap();
        s.on_frame(
            masked(Frame::data(OpCode::Continuation, Bytes::from_static(b"lo"))),
            &mut out,
        )
        .unwrap();
        // delivered to the handler's inbound queue
        let msg = s.inbound_tx.unbounded_send(Message::Text(String::new()));
        assert!(msg.is_ok());
    }

    #[test]
    fn peer_close_is_echoed() {
        let mut s = session();
        let mut out = Vec::new();
        s.on_frame(masked(Frame::close(CLOSE_NORMAL, "bye")), &mut out)
            .unwrap();
        assert!(s.close_received);
        assert!(s.close_sent);
        assert_eq!(out[0].opcode, OpCode::Close);
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn handler_completion_starts_close() {
        let mut s = Session::open(
            Box::new(|_exchange| Box::pin(futures_util::future::ready(Ok(())))),
            None,
            1024,
            true,
            Duration::from_secs(5),
        );
        let mut out = Vec::new();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(s.poll(&mut cx, &mut out).is_pending());
        assert!(s.close_sent);
        assert_eq!(out[0].opcode, OpCode::Close);
    }
}
