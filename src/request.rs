//! The immutable request side of an exchange.

use std::fmt;

use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Uri, Version};
use mime::Mime;

use crate::body::RequestBody;

/// The head of a request, immutable once built.
///
/// For HTTP/1.x the target is the URI request-target and the authority
/// comes from the `Host` header; for HTTP/2 the `:method`, `:scheme`,
/// `:authority` and `:path` pseudo-headers carry these.
#[derive(Clone)]
pub struct RequestHeaders {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    scheme: &'static str,
    authority: Option<String>,
}

impl RequestHeaders {
    pub(crate) fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        tls: bool,
    ) -> RequestHeaders {
        let authority = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_owned())
            .or_else(|| uri.authority().map(|a| a.as_str().to_owned()));
        let scheme = match uri.scheme_str() {
            Some("https") => "https",
            Some("http") => "http",
            _ if tls => "https",
            _ => "http",
        };
        RequestHeaders {
            method,
            uri,
            version,
            headers,
            scheme,
            authority,
        }
    }

    /// Builds a head from HTTP/2 pseudo-headers.
    pub(crate) fn new_h2(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        scheme: Option<&str>,
        authority: Option<String>,
    ) -> RequestHeaders {
        let scheme = match scheme {
            Some("https") => "https",
            _ => "http",
        };
        RequestHeaders {
            method,
            uri,
            version: Version::HTTP_2,
            headers,
            scheme,
            authority,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request-target path, including any query.
    pub fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }

    /// The full request-target.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The request scheme.
    pub fn scheme(&self) -> &str {
        self.scheme
    }

    /// The authority the request was addressed to.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    /// The protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The ordered header multimap.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// All values of one header, in arrival order.
    pub fn all<K: header::AsHeaderName>(&self, name: K) -> header::GetAll<'_, HeaderValue> {
        self.headers.get_all(name)
    }

    /// The parsed `content-type`, if present and well formed.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// The declared `content-length`, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Whether the request asked for `100 Continue` before sending a body.
    pub(crate) fn expects_continue(&self) -> bool {
        match self.headers.get(header::EXPECT) {
            Some(v) => v.as_bytes().eq_ignore_ascii_case(b"100-continue"),
            None => false,
        }
    }

    /// Keep-alive per version defaults and the `Connection` header.
    pub(crate) fn should_keep_alive(&self) -> bool {
        let connection = self.headers.get(header::CONNECTION);
        match self.version {
            Version::HTTP_10 => match connection {
                Some(v) => connection_has_token(v, "keep-alive"),
                None => false,
            },
            _ => match connection {
                Some(v) => !connection_has_token(v, "close"),
                None => true,
            },
        }
    }
}

fn connection_has_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .map(|s| {
            s.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

impl fmt::Debug for RequestHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHeaders")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .finish()
    }
}

/// One HTTP request: an immutable head plus a lazy body.
#[derive(Debug)]
pub struct Request {
    head: RequestHeaders,
    body: Option<RequestBody>,
}

impl Request {
    pub(crate) fn new(head: RequestHeaders, body: Option<RequestBody>) -> Request {
        Request { head, body }
    }

    /// The request head.
    pub fn headers(&self) -> &RequestHeaders {
        &self.head
    }

    /// Takes the request body.
    ///
    /// `Some` only for methods that carry one (POST, PUT, PATCH, DELETE),
    /// and only on the first call: the body is a single-subscription
    /// stream.
    pub fn body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }
}

/// Whether a method carries a request body at all.
pub(crate) fn method_has_body(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}
