//! The framed transport seam between a connection and the wire.
//!
//! A connection never touches raw bytes. The byte-level work — TLS, HTTP
//! parsing and encoding, WebSocket framing — lives in an external framer
//! behind the [`Channel`] trait, which carries already-framed protocol
//! messages in both directions.
//!
//! Sending is split in two: [`Channel::send`] only buffers, and
//! [`Channel::poll_flush`] pushes buffered frames out. Connections exploit
//! the split to coalesce flushes to one per read batch.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use bytes::Bytes;

/// A full-duplex carrier of framed protocol messages.
///
/// The connection is the exclusive owner of its channel; when the
/// connection finishes, the channel is shut down on every exit path.
pub trait Channel {
    /// Frames arriving from the peer.
    type Recv;
    /// Frames leaving toward the peer.
    type Send;

    /// Polls the next inbound frame.
    ///
    /// `None` means the peer closed the read side. Errors are framer decode
    /// failures or I/O failures; the connection decides whether they are
    /// fatal.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<crate::Result<Self::Recv>>>;

    /// Buffers an outbound frame without flushing it.
    fn send(&mut self, frame: Self::Send);

    /// Flushes everything buffered by [`send`](Channel::send).
    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Flushes, then closes the transport.
    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>;

    /// Static facts about the underlying transport.
    fn info(&self) -> &ChannelInfo;
}

/// An HTTP/1.x channel that can have its pipeline re-plumbed for a
/// WebSocket session, and restored if the handshake falls through.
pub trait SwitchChannel: Channel {
    /// An opaque snapshot of the pipeline configuration, sufficient to
    /// restore it.
    type Snapshot;

    /// Captures the current pipeline so it can be restored later.
    fn snapshot(&mut self) -> Self::Snapshot;

    /// Installs the WebSocket protocol handler. Subsequent inbound frames
    /// are WebSocket frames.
    fn install_web_socket(&mut self, params: &crate::ws::PipelineParams);

    /// Restores a previously captured pipeline, undoing
    /// [`install_web_socket`](SwitchChannel::install_web_socket).
    fn restore(&mut self, snapshot: Self::Snapshot);
}

/// Facts about the transport below a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelInfo {
    tls: bool,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    local_certificates: Vec<Certificate>,
    remote_certificates: Vec<Certificate>,
}

impl ChannelInfo {
    /// A plaintext channel with no addresses, useful for tests.
    pub fn new() -> ChannelInfo {
        ChannelInfo::default()
    }

    /// Marks the channel as TLS-terminated.
    pub fn with_tls(mut self, tls: bool) -> ChannelInfo {
        self.tls = tls;
        self
    }

    /// Sets the local address.
    pub fn with_local_addr(mut self, addr: SocketAddr) -> ChannelInfo {
        self.local_addr = Some(addr);
        self
    }

    /// Sets the remote address.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> ChannelInfo {
        self.remote_addr = Some(addr);
        self
    }

    /// Sets the certificate chain presented by this side.
    pub fn with_local_certificates(mut self, certs: Vec<Certificate>) -> ChannelInfo {
        self.local_certificates = certs;
        self
    }

    /// Sets the certificate chain presented by the peer.
    pub fn with_remote_certificates(mut self, certs: Vec<Certificate>) -> ChannelInfo {
        self.remote_certificates = certs;
        self
    }

    /// Whether the transport is TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// The local socket address, when the transport has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The remote socket address, when the transport has one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Certificates presented by this side during the TLS handshake.
    pub fn local_certificates(&self) -> &[Certificate] {
        &self.local_certificates
    }

    /// Certificates presented by the peer during the TLS handshake.
    pub fn remote_certificates(&self) -> &[Certificate] {
        &self.remote_certificates
    }
}

/// A DER-encoded certificate, opaque to this crate.
#[derive(Clone)]
pub struct Certificate(Bytes);

impl Certificate {
    /// Wraps DER bytes.
    pub fn from_der<B: Into<Bytes>>(der: B) -> Certificate {
        Certificate(der.into())
    }

    /// The DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.0.len())
            .finish()
    }
}

/// The HTTP protocol a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// HTTP/1.1 (and 1.0 requests on the same connection).
    Http11,
    /// HTTP/2.
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http11 => "HTTP/1.1",
            Protocol::Http2 => "HTTP/2",
        })
    }
}
