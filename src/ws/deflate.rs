//! Deflate WebSocket extension negotiation.
//!
//! Two extensions exist in the wild: `permessage-deflate` (RFC 7692) and
//! the older draft `deflate-frame` / `x-webkit-deflate-frame`. When both
//! are configured and offered, per-message wins; at most one extension is
//! ever negotiated per connection. The actual deflate transform runs in
//! the channel pipeline; this module only settles parameters (and, with
//! the `ws-deflate` feature, provides the transform for pipelines that
//! want it).

use http::header::{self, HeaderMap, HeaderValue};

use crate::config::ServerConfig;

/// Parameters settled for the negotiated deflate extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateParams {
    /// True for `permessage-deflate`, false for the per-frame draft.
    pub per_message: bool,
    /// The server resets its compression context after every message.
    pub server_no_context_takeover: bool,
    /// The client must reset its compression context after every message.
    pub client_no_context_takeover: bool,
    /// The server's LZ77 window, when the client constrained it.
    pub server_max_window_bits: Option<u8>,
    /// The client's LZ77 window, when the server constrained it.
    pub client_max_window_bits: Option<u8>,
    /// The compression level the server-side transform should use.
    pub level: u32,
}

/// One parsed extension offer.
#[derive(Debug, Default)]
struct Offer {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    // `Some(0)` means the parameter was present without a value
    client_max_window_bits: Option<u8>,
    malformed: bool,
}

/// Negotiates against the client's `Sec-WebSocket-Extensions` offers.
///
/// Returns the response header value and the settled parameters, or `None`
/// when nothing acceptable was offered (which is not an error: the session
/// simply runs uncompressed).
pub(crate) fn negotiate(
    headers: &HeaderMap,
    config: &ServerConfig,
) -> Option<(HeaderValue, DeflateParams)> {
    let mut frame_offered = false;
    let mut frame_token = "";

    for value in headers.get_all(header::SEC_WEBSOCKET_EXTENSIONS) {
        let value = match value.to_str() {
            Ok(value) => value,
            Err(_) => continue,
        };
        for offer_str in value.split(',') {
            let mut parts = offer_str.split(';').map(str::trim);
            let name = match parts.next() {
                Some(name) => name,
                None => continue,
            };
            if name.eq_ignore_ascii_case("permessage-deflate") {
                if !config.ws_message_compression_enabled {
                    continue;
                }
                let offer = parse_offer(parts);
                if let Some(settled) = answer_per_message(&offer, config) {
                    return Some(settled);
                }
            } else if name.eq_ignore_ascii_case("deflate-frame")
                || name.eq_ignore_ascii_case("x-webkit-deflate-frame")
            {
                if config.ws_frame_compression_enabled && !frame_offered {
                    frame_offered = true;
                    frame_token = if name.eq_ignore_ascii_case("deflate-frame") {
                        "deflate-frame"
                    } else {
                        "x-webkit-deflate-frame"
                    };
                }
            }
        }
    }

    // the per-frame draft only answers when per-message didn't
    if frame_offered {
        let params = DeflateParams {
            per_message: false,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
            level: config.ws_frame_compression_level,
        };
        let value = HeaderValue::from_str(frame_token).expect("static token");
        return Some((value, params));
    }
    None
}

fn parse_offer<'a, I: Iterator<Item = &'a str>>(parts: I) -> Offer {
    let mut offer = Offer::default();
    for part in parts {
        let mut kv = part.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        let value = kv.next().map(|v| v.trim().trim_matches('"'));
        if key.eq_ignore_ascii_case("server_no_context_takeover") {
            offer.server_no_context_takeover = true;
        } else if key.eq_ignore_ascii_case("client_no_context_takeover") {
            offer.client_no_context_takeover = true;
        } else if key.eq_ignore_ascii_case("server_max_window_bits") {
            match value.and_then(|v| v.parse::<u8>().ok()) {
                Some(bits) if (8..=15).contains(&bits) => {
                    offer.server_max_window_bits = Some(bits)
                }
                _ => offer.malformed = true,
            }
        } else if key.eq_ignore_ascii_case("client_max_window_bits") {
            match value {
                None => offer.client_max_window_bits = Some(0),
                Some(v) => match v.parse::<u8>() {
                    Ok(bits) if (8..=15).contains(&bits) => {
                        offer.client_max_window_bits = Some(bits)
                    }
                    _ => offer.malformed = true,
                },
            }
        } else if !key.is_empty() {
            offer.malformed = true;
        }
    }
    offer
}

fn answer_per_message(
    offer: &Offer,
    config: &ServerConfig,
) -> Option<(HeaderValue, DeflateParams)> {
    if offer.malformed {
        return None;
    }
    if offer.server_max_window_bits.is_some()
        && !config.ws_message_compression_allow_server_window_size
    {
        return None;
    }
    if offer.server_no_context_takeover && !config.ws_message_compression_allow_server_no_context {
        return None;
    }

    let mut params = DeflateParams {
        per_message: true,
        server_no_context_takeover: offer.server_no_context_takeover,
        client_no_context_takeover: offer.client_no_context_takeover,
        server_max_window_bits: offer.server_max_window_bits,
        client_max_window_bits: None,
        level: config.ws_message_compression_level,
    };

    let mut value = String::from("permessage-deflate");
    if params.server_no_context_takeover {
        value.push_str("; server_no_context_takeover");
    }
    if config.ws_message_compression_preferred_client_no_context {
        params.client_no_context_takeover = true;
    }
    if params.client_no_context_takeover {
        value.push_str("; client_no_context_takeover");
    }
    if let Some(bits) = params.server_max_window_bits {
        value.push_str("; server_max_window_bits=");
        value.push_str(&bits.to_string());
    }
    // only constrain the client when it offered the parameter
    if let Some(offered) = offer.client_max_window_bits {
        if let Some(preferred) = config.ws_message_compression_preferred_client_window_size {
            let bits = if offered == 0 { preferred } else { offered.min(preferred) };
            params.client_max_window_bits = Some(bits);
            value.push_str("; client_max_window_bits=");
            value.push_str(&bits.to_string());
        }
    }

    let value = HeaderValue::from_str(&value).ok()?;
    Some((value, params))
}

// ===== deflate transform (feature gated) =====

/// A per-message deflate transform for channel pipelines.
///
/// Raw deflate, with the trailing `00 00 ff ff` flush marker stripped on
/// compress and restored on decompress, per RFC 7692 §7.2.
#[cfg(feature = "ws-deflate")]
pub mod transform {
    use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

    use super::DeflateParams;

    const FLUSH_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

    /// Server-side compressor honoring the negotiated context takeover.
    pub struct MessageDeflater {
        compress: Compress,
        reset_per_message: bool,
    }

    impl std::fmt::Debug for MessageDeflater {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MessageDeflater")
                .field("reset_per_message", &self.reset_per_message)
                .finish()
        }
    }

    impl MessageDeflater {
        /// Builds a compressor from negotiated parameters.
        pub fn new(params: &DeflateParams) -> MessageDeflater {
            MessageDeflater {
                compress: Compress::new(Compression::new(params.level), false),
                reset_per_message: params.server_no_context_takeover,
            }
        }

        /// Compresses one message payload.
        pub fn compress(&mut self, input: &[u8]) -> crate::Result<Vec<u8>> {
            let mut out = Vec::with_capacity(input.len() / 2 + 16);
            let start_in = self.compress.total_in();
            loop {
                let consumed = (self.compress.total_in() - start_in) as usize;
                self.compress
                    .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                    .map_err(|e| crate::Error::new_ws_corrupted_frame().with(e))?;
                let consumed = (self.compress.total_in() - start_in) as usize;
                // the sync flush is complete once input is gone and the
                // output buffer did not fill to the brim
                if consumed == input.len() && out.len() < out.capacity() {
                    break;
                }
                out.reserve(64 + out.len());
            }
            if out.ends_with(&FLUSH_MARKER) {
                out.truncate(out.len() - FLUSH_MARKER.len());
            }
            if self.reset_per_message {
                self.compress.reset();
            }
            Ok(out)
        }
    }

    /// Server-side decompressor for client messages.
    pub struct MessageInflater {
        decompress: Decompress,
        reset_per_message: bool,
    }

    impl std::fmt::Debug for MessageInflater {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MessageInflater")
                .field("reset_per_message", &self.reset_per_message)
                .finish()
        }
    }

    impl MessageInflater {
        /// Builds a decompressor from negotiated parameters.
        pub fn new(params: &DeflateParams) -> MessageInflater {
            MessageInflater {
                decompress: Decompress::new(false),
                reset_per_message: params.client_no_context_takeover,
            }
        }

        /// Decompresses one message payload.
        pub fn decompress(&mut self, input: &[u8]) -> crate::Result<Vec<u8>> {
            let mut data = input.to_vec();
            data.extend_from_slice(&FLUSH_MARKER);
            let mut out = Vec::with_capacity(data.len() * 2);
            let start_in = self.decompress.total_in();
            loop {
                let consumed = (self.decompress.total_in() - start_in) as usize;
                self.decompress
                    .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                    .map_err(|e| crate::Error::new_ws_corrupted_frame().with(e))?;
                let consumed = (self.decompress.total_in() - start_in) as usize;
                if consumed == data.len() && out.len() < out.capacity() {
                    break;
                }
                out.reserve(64 + out.len());
            }
            if self.reset_per_message {
                self.decompress.reset(false);
            }
            Ok(out)
        }
    }
}
