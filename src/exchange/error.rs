//! The built-in last-resort error response.

use http::header::{HeaderValue, ALLOW, RETRY_AFTER};
use http::StatusCode;

use crate::error::HttpError;
use crate::response::Response;

/// Configures the generic error response for a failed exchange.
///
/// An [`HttpError`] in the cause chain selects the status and decorates
/// `405` with `Allow` and `503` with `Retry-After`; a malformed-input
/// failure maps to its 4xx; anything else is a `500`. The body is always
/// empty. Fails only when the headers are already on the wire, in which
/// case the caller can do nothing but shut the connection down.
pub(crate) fn generic_error_handler(response: &Response, error: &crate::Error) -> crate::Result<()> {
    if response.is_written() {
        return Err(crate::Error::new_headers_written());
    }
    let mut headers = response.headers()?;

    if let Some(http_error) = error.find_source::<HttpError>() {
        let status = http_error.status_code();
        if status == StatusCode::METHOD_NOT_ALLOWED && !http_error.allowed_methods().is_empty() {
            let allow = http_error
                .allowed_methods()
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                headers.insert(ALLOW, value);
            }
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            if let Some(retry_after) = http_error.retry_after() {
                let formatted = httpdate::fmt_http_date(retry_after);
                if let Ok(value) = HeaderValue::from_str(&formatted) {
                    headers.insert(RETRY_AFTER, value);
                }
            }
        }
        headers.status(status);
    } else if error.is_parse() || error.is_multipart() {
        headers.status(error.synthesized_status());
    } else {
        headers.status(StatusCode::INTERNAL_SERVER_ERROR);
    }
    drop(headers);

    response.body().empty();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::time::{Duration, SystemTime};

    fn run(error: crate::Error) -> (StatusCode, http::HeaderMap) {
        let (response, cell) = Response::new();
        generic_error_handler(&response, &error).expect("handler");
        let state = cell.take_state();
        (state.status, state.headers)
    }

    #[test]
    fn http_error_status_is_used() {
        let (status, _) = run(crate::Error::new_user_handler(HttpError::not_found()));
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn method_not_allowed_advertises_allow() {
        let (status, headers) = run(crate::Error::new_user_handler(
            HttpError::method_not_allowed(vec![Method::GET, Method::HEAD]),
        ));
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(headers.get(ALLOW).unwrap(), "GET, HEAD");
    }

    #[test]
    fn service_unavailable_advertises_retry_after() {
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let (status, headers) = run(crate::Error::new_user_handler(
            HttpError::service_unavailable(Some(when)),
        ));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        // RFC 5322 date-time
        assert!(headers
            .get(RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("GMT"));
    }

    #[test]
    fn malformed_input_maps_to_its_4xx() {
        let (status, _) = run(crate::Error::new_bad_request());
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn anything_else_is_500() {
        let (status, _) = run(crate::Error::new_user_handler("boom"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn written_headers_cannot_be_recovered() {
        let (response, cell) = Response::new();
        cell.mark_written();
        let err = generic_error_handler(&response, &crate::Error::new_user_handler("late"))
            .unwrap_err();
        assert!(err.is_headers_written());
    }
}
