//! Url-encoded form parameter decoding.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use futures_core::Stream;
use futures_util::ready;
use percent_encoding::percent_decode;

use super::RequestBody;

/// One decoded `application/x-www-form-urlencoded` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    name: String,
    value: String,
}

impl Parameter {
    /// The parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameter value, possibly empty.
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A lazy stream of form parameters over a request body.
///
/// Parameters are emitted as soon as their terminating `&` (or the end of
/// the body) is seen; the body is never buffered whole.
#[must_use = "streams do nothing unless polled"]
pub struct UrlEncoded {
    body: Option<RequestBody>,
    buf: BytesMut,
}

impl UrlEncoded {
    pub(crate) fn new(body: RequestBody) -> UrlEncoded {
        UrlEncoded {
            body: Some(body),
            buf: BytesMut::new(),
        }
    }

    fn take_pair(&mut self) -> Option<crate::Result<Parameter>> {
        loop {
            let sep = self.buf.iter().position(|&b| b == b'&')?;
            let raw = self.buf.split_to(sep);
            self.buf.advance(1);
            if raw.is_empty() {
                // tolerate "a=1&&b=2"
                continue;
            }
            return Some(decode_pair(&raw));
        }
    }
}

impl Stream for UrlEncoded {
    type Item = crate::Result<Parameter>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(pair) = self.take_pair() {
                return Poll::Ready(Some(pair));
            }
            let chunk = match self.body {
                Some(ref mut body) => ready!(Pin::new(body).poll_next(cx)),
                None => None,
            };
            match chunk {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    self.body = None;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    self.body = None;
                    if self.buf.is_empty() {
                        return Poll::Ready(None);
                    }
                    let raw = self.buf.split();
                    return Poll::Ready(Some(decode_pair(&raw)));
                }
            }
        }
    }
}

fn decode_pair(raw: &[u8]) -> crate::Result<Parameter> {
    let eq = raw.iter().position(|&b| b == b'=');
    let (name, value) = match eq {
        Some(i) => (&raw[..i], &raw[i + 1..]),
        None => (raw, &[][..]),
    };
    Ok(Parameter {
        name: decode_component(name)?,
        value: decode_component(value)?,
    })
}

fn decode_component(raw: &[u8]) -> crate::Result<String> {
    let mut spaced = Vec::with_capacity(raw.len());
    for &b in raw {
        spaced.push(if b == b'+' { b' ' } else { b });
    }
    percent_decode(&spaced)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| crate::Error::new_bad_request())
}

impl fmt::Debug for UrlEncoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlEncoded")
            .field("buffered", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::StreamExt;

    async fn decode_all(input: &'static [u8]) -> Vec<Parameter> {
        let (mut tx, body) = super::super::channel::channel(None);
        let mut form = UrlEncoded::new(body);
        // one chunk is enough for these inputs; the channel holds one slot
        tx.try_send_data(Bytes::from_static(input)).unwrap();
        tx.complete(None);
        let mut out = Vec::new();
        while let Some(p) = form.next().await {
            out.push(p.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn decodes_pairs() {
        let params = decode_all(b"a=1&name=j%20doe&flag").await;
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].name(), "a");
        assert_eq!(params[0].value(), "1");
        assert_eq!(params[1].value(), "j doe");
        assert_eq!(params[2].name(), "flag");
        assert_eq!(params[2].value(), "");
    }

    #[tokio::test]
    async fn plus_becomes_space() {
        let params = decode_all(b"q=two+words").await;
        assert_eq!(params[0].value(), "two words");
    }
}
