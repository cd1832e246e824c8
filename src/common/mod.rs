use std::time::SystemTime;

use http::header::{HeaderValue, DATE};
use http::HeaderMap;

/// Fill in a `Date` header if the map doesn't carry one yet.
pub(crate) fn ensure_date_header(headers: &mut HeaderMap) {
    if !headers.contains_key(DATE) {
        let now = httpdate::fmt_http_date(SystemTime::now());
        if let Ok(value) = HeaderValue::from_str(&now) {
            headers.insert(DATE, value);
        }
    }
}

/// Render a content-length value without going through `format!`.
pub(crate) fn content_length_value(len: u64) -> HeaderValue {
    let mut buf = itoa::Buffer::new();
    HeaderValue::from_str(buf.format(len)).expect("itoa output is a valid header value")
}
