//! The WebSocket opening handshake (RFC 6455 §4).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{self, HeaderValue};
use http::Method;
use sha1::{Digest, Sha1};

use crate::config::ServerConfig;
use crate::request::RequestHeaders;

use super::deflate::{self, DeflateParams};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Everything negotiated by a successful handshake.
#[derive(Debug)]
pub(crate) struct Handshake {
    /// The `Sec-WebSocket-Accept` value.
    pub(crate) accept: HeaderValue,
    /// The subprotocol both sides agreed on.
    pub(crate) subprotocol: Option<String>,
    /// The `Sec-WebSocket-Extensions` answer, when deflate was negotiated.
    pub(crate) extensions: Option<HeaderValue>,
    /// Parameters for the channel's deflate transform.
    pub(crate) deflate: Option<DeflateParams>,
}

/// Validates the upgrade request and negotiates subprotocol and
/// extensions. Any violated precondition fails the handshake; the caller
/// decides between the registered fallback and the error-exchange path.
pub(crate) fn negotiate(
    head: &RequestHeaders,
    offered_subprotocols: &[String],
    config: &ServerConfig,
) -> crate::Result<Handshake> {
    if !config.ws_enabled {
        return Err(crate::Error::new_ws_handshake());
    }
    if head.method() != Method::GET {
        return Err(crate::Error::new_ws_handshake());
    }
    if !header_has_token(head, header::UPGRADE, "websocket") {
        return Err(crate::Error::new_ws_handshake());
    }
    if !header_has_token(head, header::CONNECTION, "upgrade") {
        return Err(crate::Error::new_ws_handshake());
    }
    match head.headers().get(header::SEC_WEBSOCKET_VERSION) {
        Some(v) if v.as_bytes() == b"13" => {}
        _ => return Err(crate::Error::new_ws_handshake()),
    }
    let key = head
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or_else(crate::Error::new_ws_handshake)?;

    let accept = accept_key(key.as_bytes());

    let subprotocol = negotiate_subprotocol(head, offered_subprotocols);
    let (extensions, deflate) = match deflate::negotiate(head.headers(), config) {
        Some((value, params)) => (Some(value), Some(params)),
        None => (None, None),
    };

    Ok(Handshake {
        accept,
        subprotocol,
        extensions,
        deflate,
    })
}

/// `base64(sha1(key ++ GUID))`.
pub(crate) fn accept_key(key: &[u8]) -> HeaderValue {
    let mut sha1 = Sha1::default();
    sha1.update(key);
    sha1.update(GUID);
    let b64 = BASE64.encode(sha1.finalize());
    HeaderValue::from_str(&b64).expect("base64 output is a valid header value")
}

fn negotiate_subprotocol(head: &RequestHeaders, offered: &[String]) -> Option<String> {
    if offered.is_empty() {
        return None;
    }
    for value in head.all(header::SEC_WEBSOCKET_PROTOCOL) {
        let value = match value.to_str() {
            Ok(value) => value,
            Err(_) => continue,
        };
        for requested in value.split(',').map(str::trim) {
            if offered.iter().any(|o| o.eq_ignore_ascii_case(requested)) {
                return Some(requested.to_owned());
            }
        }
    }
    None
}

fn header_has_token(head: &RequestHeaders, name: header::HeaderName, token: &str) -> bool {
    head.all(name).iter().any(|value| {
        value
            .to_str()
            .map(|s| {
                s.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}
