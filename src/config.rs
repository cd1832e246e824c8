//! Server configuration, frozen at connection creation.

use std::time::Duration;

/// Configuration shared by every connection of a server instance.
///
/// A config is built once with [`ServerConfig::builder`] and handed to each
/// connection at creation; connections never observe later changes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) graceful_shutdown_timeout: Duration,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) http1x_validate_headers: bool,

    pub(crate) ws_enabled: bool,
    pub(crate) ws_max_frame_size: usize,
    pub(crate) ws_allow_mask_mismatch: bool,
    pub(crate) ws_close_timeout: Duration,
    pub(crate) ws_handshake_timeout: Duration,
    pub(crate) ws_frame_compression_enabled: bool,
    pub(crate) ws_frame_compression_level: u32,
    pub(crate) ws_message_compression_enabled: bool,
    pub(crate) ws_message_compression_level: u32,
    pub(crate) ws_message_compression_allow_server_window_size: bool,
    pub(crate) ws_message_compression_preferred_client_window_size: Option<u8>,
    pub(crate) ws_message_compression_allow_server_no_context: bool,
    pub(crate) ws_message_compression_preferred_client_no_context: bool,

    pub(crate) multipart_max_parts: usize,
    pub(crate) multipart_max_part_header_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            graceful_shutdown_timeout: Duration::from_secs(30),
            idle_timeout: None,
            http1x_validate_headers: false,
            ws_enabled: true,
            ws_max_frame_size: 65536,
            ws_allow_mask_mismatch: false,
            ws_close_timeout: Duration::from_secs(10),
            ws_handshake_timeout: Duration::from_secs(10),
            ws_frame_compression_enabled: false,
            ws_frame_compression_level: 6,
            ws_message_compression_enabled: false,
            ws_message_compression_level: 6,
            ws_message_compression_allow_server_window_size: false,
            ws_message_compression_preferred_client_window_size: None,
            ws_message_compression_allow_server_no_context: false,
            ws_message_compression_preferred_client_no_context: false,
            multipart_max_parts: 256,
            multipart_max_part_header_bytes: 8192,
        }
    }
}

impl ServerConfig {
    /// Starts building a config from the defaults.
    pub fn builder() -> Builder {
        Builder {
            config: ServerConfig::default(),
        }
    }

    /// How long a graceful shutdown waits for in-flight exchanges.
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        self.graceful_shutdown_timeout
    }

    /// Whether WebSocket upgrades are accepted at all.
    pub fn ws_enabled(&self) -> bool {
        self.ws_enabled
    }
}

/// A builder for [`ServerConfig`].
#[derive(Debug)]
pub struct Builder {
    config: ServerConfig,
}

impl Builder {
    /// Sets how long a graceful shutdown waits for in-flight exchanges
    /// before closing forcibly.
    ///
    /// Default is 30 seconds.
    pub fn graceful_shutdown_timeout(mut self, timeout: Duration) -> Builder {
        self.config.graceful_shutdown_timeout = timeout;
        self
    }

    /// Closes a connection that stays idle (no exchange in flight) for the
    /// given duration. Disabled by default.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Builder {
        self.config.idle_timeout = timeout;
        self
    }

    /// Enables strict validation of HTTP/1.x request heads beyond what the
    /// framer guarantees, such as requiring a `Host` header on HTTP/1.1.
    ///
    /// Default is off.
    pub fn http1x_validate_headers(mut self, enabled: bool) -> Builder {
        self.config.http1x_validate_headers = enabled;
        self
    }

    /// Enables or disables WebSocket upgrades. Default is on.
    pub fn ws_enabled(mut self, enabled: bool) -> Builder {
        self.config.ws_enabled = enabled;
        self
    }

    /// Largest WebSocket frame payload accepted before the frame is
    /// considered corrupted. Default is 64 KiB.
    pub fn ws_max_frame_size(mut self, max: usize) -> Builder {
        self.config.ws_max_frame_size = max;
        self
    }

    /// Tolerates client frames with a bad masking bit instead of failing
    /// the connection. Default is off.
    pub fn ws_allow_mask_mismatch(mut self, allow: bool) -> Builder {
        self.config.ws_allow_mask_mismatch = allow;
        self
    }

    /// How long to wait for the peer's close frame during the closing
    /// handshake. Default is 10 seconds.
    pub fn ws_close_timeout(mut self, timeout: Duration) -> Builder {
        self.config.ws_close_timeout = timeout;
        self
    }

    /// How long the opening handshake may take. Default is 10 seconds.
    pub fn ws_handshake_timeout(mut self, timeout: Duration) -> Builder {
        self.config.ws_handshake_timeout = timeout;
        self
    }

    /// Offers the draft `deflate-frame` extension. Only answered when the
    /// client did not also offer `permessage-deflate`. Default is off.
    pub fn ws_frame_compression(mut self, enabled: bool, level: u32) -> Builder {
        self.config.ws_frame_compression_enabled = enabled;
        self.config.ws_frame_compression_level = level;
        self
    }

    /// Offers `permessage-deflate` (RFC 7692). Default is off.
    pub fn ws_message_compression(mut self, enabled: bool, level: u32) -> Builder {
        self.config.ws_message_compression_enabled = enabled;
        self.config.ws_message_compression_level = level;
        self
    }

    /// Accepts a client-requested `server_max_window_bits` parameter
    /// instead of rejecting the offer. Default is off.
    pub fn ws_message_compression_allow_server_window_size(mut self, allow: bool) -> Builder {
        self.config.ws_message_compression_allow_server_window_size = allow;
        self
    }

    /// Requests this `client_max_window_bits` (8..=15) from the client in
    /// the negotiated response. Default is none.
    pub fn ws_message_compression_preferred_client_window_size(
        mut self,
        bits: Option<u8>,
    ) -> Builder {
        self.config.ws_message_compression_preferred_client_window_size = bits;
        self
    }

    /// Accepts a client-requested `server_no_context_takeover`. Default is
    /// off.
    pub fn ws_message_compression_allow_server_no_context(mut self, allow: bool) -> Builder {
        self.config.ws_message_compression_allow_server_no_context = allow;
        self
    }

    /// Requests `client_no_context_takeover` from the client. Default is
    /// off.
    pub fn ws_message_compression_preferred_client_no_context(mut self, prefer: bool) -> Builder {
        self.config.ws_message_compression_preferred_client_no_context = prefer;
        self
    }

    /// Most parts a single multipart body may contain. Default is 256.
    pub fn multipart_max_parts(mut self, max: usize) -> Builder {
        self.config.multipart_max_parts = max;
        self
    }

    /// Largest header section a single part may carry, in bytes. Default is
    /// 8 KiB.
    pub fn multipart_max_part_header_bytes(mut self, max: usize) -> Builder {
        self.config.multipart_max_part_header_bytes = max;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
