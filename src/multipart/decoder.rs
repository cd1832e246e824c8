//! The `multipart/form-data` streaming state machine.
//!
//! Driven chunk by chunk: the caller appends wire bytes to a keep buffer
//! and calls [`Decoder::decode`], which consumes what it can and emits
//! events. Bytes that might belong to a split boundary stay in the buffer
//! for the next round. Nested `multipart/mixed` is supported exactly one
//! level deep.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use mime::Mime;

use crate::error::Multipart as MultipartKind;

use super::MultipartLimits;

const MAX_PART_HEADERS: usize = 32;

/// What the decoder saw.
#[derive(Debug)]
pub(crate) enum Event {
    /// A new part's headers are complete; its data follows.
    PartStart(PartHead),
    /// Bytes belonging to the current part.
    Data(Bytes),
    /// The current part's terminating boundary was observed.
    PartEnd,
}

/// The decoded head of one part.
#[derive(Debug, Clone)]
pub(crate) struct PartHead {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) content_type: Option<Mime>,
    pub(crate) headers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting (an opening or in-between) boundary delimiter.
    Boundary,
    /// Reading one header field per line until the empty line.
    Headers,
    /// Streaming part data, watching for the next delimiter.
    Data,
    /// Just after a delimiter: `--` closes, anything else is a next part.
    End,
    /// The closing delimiter was consumed; everything else is epilogue.
    Terminated,
}

pub(crate) struct Decoder {
    /// `--<boundary>` for the multipart currently being read.
    delimiter: Vec<u8>,
    /// The outer delimiter and field name while inside `multipart/mixed`.
    outer: Option<(Vec<u8>, String)>,
    state: State,
    limits: MultipartLimits,
    parts_seen: usize,
}

impl Decoder {
    pub(crate) fn new(boundary: &str, limits: MultipartLimits) -> Decoder {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Decoder {
            delimiter,
            outer: None,
            state: State::Boundary,
            limits,
            parts_seen: 0,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state == State::Terminated
    }

    /// The body ended. Only fine if the closing delimiter was seen.
    pub(crate) fn finish(&self) -> crate::Result<()> {
        if self.is_terminated() {
            Ok(())
        } else {
            Err(crate::Error::new_multipart(MultipartKind::MalformedBody))
        }
    }

    /// Consumes as much of `buf` as possible, emitting events. Bytes that
    /// need more context are left in `buf`.
    pub(crate) fn decode(
        &mut self,
        buf: &mut BytesMut,
        events: &mut Vec<Event>,
    ) -> crate::Result<()> {
        loop {
            let before = (self.state, buf.len());
            match self.state {
                State::Boundary => self.read_boundary(buf)?,
                State::Headers => self.read_headers(buf, events)?,
                State::Data => self.read_data(buf, events),
                State::End => self.read_end(buf, events)?,
                State::Terminated => {
                    // epilogue is ignored
                    buf.clear();
                    return Ok(());
                }
            }
            if before == (self.state, buf.len()) {
                // no progress: await more bytes
                return Ok(());
            }
        }
    }

    fn read_boundary(&mut self, buf: &mut BytesMut) -> crate::Result<()> {
        // skip leading control characters (and with them any CRLF)
        let skip = buf.iter().take_while(|&&b| b < 0x20).count();
        buf.advance(skip);

        let delim = self.delimiter.len();
        if buf.len() < delim {
            if !self.delimiter.starts_with(&buf[..]) {
                return Err(crate::Error::new_multipart(MultipartKind::MalformedBody));
            }
            return Ok(()); // await more
        }
        if buf[..delim] != self.delimiter[..] {
            return Err(crate::Error::new_multipart(MultipartKind::MalformedBody));
        }

        // the discriminator after the delimiter
        match discriminate(&buf[delim..]) {
            Discriminator::Opening(consumed) => {
                buf.advance(delim + consumed);
                self.state = State::Headers;
                Ok(())
            }
            Discriminator::Closing => {
                buf.advance(delim + 2);
                self.close_current();
                Ok(())
            }
            Discriminator::NeedMore => Ok(()),
            Discriminator::Invalid => {
                Err(crate::Error::new_multipart(MultipartKind::MalformedBody))
            }
        }
    }

    fn read_headers(&mut self, buf: &mut BytesMut, events: &mut Vec<Event>) -> crate::Result<()> {
        let block_end = match find_block_end(buf) {
            Some(end) => end,
            None => {
                if buf.len() > self.limits.max_part_header_bytes {
                    return Err(crate::Error::new_multipart(MultipartKind::LimitExceeded));
                }
                return Ok(()); // await more
            }
        };
        if block_end > self.limits.max_part_header_bytes {
            return Err(crate::Error::new_multipart(MultipartKind::LimitExceeded));
        }

        let mut headers = HeaderMap::new();
        {
            let mut raw = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
            let parsed = httparse::parse_headers(&buf[..block_end], &mut raw)
                .map_err(|_| crate::Error::new_multipart(MultipartKind::MalformedBody))?;
            let raw_headers = match parsed {
                httparse::Status::Complete((_, raw_headers)) => raw_headers,
                httparse::Status::Partial => {
                    return Err(crate::Error::new_multipart(MultipartKind::MalformedBody));
                }
            };
            for h in raw_headers {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| crate::Error::new_multipart(MultipartKind::MalformedBody))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| crate::Error::new_multipart(MultipartKind::MalformedBody))?;
                headers.append(name, value);
            }
        }
        buf.advance(block_end);

        let disposition = headers
            .get(http::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(parse_disposition);
        let content_type: Option<Mime> = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());

        if let Some(ref mime) = content_type {
            if mime.type_() == mime::MULTIPART && mime.subtype().as_str() == "mixed" {
                if self.outer.is_some() {
                    return Err(crate::Error::new_multipart(MultipartKind::NestedMixed));
                }
                let (name, _) = disposition
                    .ok_or_else(|| crate::Error::new_multipart(MultipartKind::MissingDisposition))?;
                let name = name
                    .ok_or_else(|| crate::Error::new_multipart(MultipartKind::MissingDisposition))?;
                let boundary = mime
                    .get_param(mime::BOUNDARY)
                    .ok_or_else(|| crate::Error::new_multipart(MultipartKind::MissingBoundary))?;
                let mut inner = Vec::with_capacity(boundary.as_str().len() + 2);
                inner.extend_from_slice(b"--");
                inner.extend_from_slice(boundary.as_str().as_bytes());
                let outer = std::mem::replace(&mut self.delimiter, inner);
                self.outer = Some((outer, name));
                self.state = State::Boundary;
                return Ok(());
            }
        }

        let (name, filename) = match self.outer {
            Some((_, ref outer_name)) => {
                // entries of a mixed group belong to the outer field
                let (name, filename) = disposition.unwrap_or((None, None));
                if filename.is_none() && name.is_none() {
                    return Err(crate::Error::new_multipart(
                        MultipartKind::FieldlessMixedEntry,
                    ));
                }
                (name.unwrap_or_else(|| outer_name.clone()), filename)
            }
            None => {
                let (name, filename) = disposition
                    .ok_or_else(|| crate::Error::new_multipart(MultipartKind::MissingDisposition))?;
                let name = name
                    .ok_or_else(|| crate::Error::new_multipart(MultipartKind::MissingDisposition))?;
                (name, filename)
            }
        };

        self.parts_seen += 1;
        if self.parts_seen > self.limits.max_parts {
            return Err(crate::Error::new_multipart(MultipartKind::LimitExceeded));
        }

        events.push(Event::PartStart(PartHead {
            name,
            filename,
            content_type,
            headers,
        }));
        self.state = State::Data;
        Ok(())
    }

    fn read_data(&mut self, buf: &mut BytesMut, events: &mut Vec<Event>) {
        match scan_data(buf, &self.delimiter) {
            Scan::Found { data_end, resume } => {
                if data_end > 0 {
                    events.push(Event::Data(buf.split_to(data_end).freeze()));
                    buf.advance(resume - data_end);
                } else {
                    buf.advance(resume);
                }
                events.push(Event::PartEnd);
                self.state = State::End;
            }
            Scan::Safe { emit_up_to } => {
                if emit_up_to > 0 {
                    events.push(Event::Data(buf.split_to(emit_up_to).freeze()));
                }
                // the rest could be the start of a boundary; await more
            }
        }
    }

    fn read_end(&mut self, buf: &mut BytesMut, _events: &mut Vec<Event>) -> crate::Result<()> {
        if buf.is_empty() {
            return Ok(()); // await more
        }
        if buf[0] == b'-' {
            if buf.len() < 2 {
                return Ok(());
            }
            if buf[1] == b'-' {
                buf.advance(2);
                self.close_current();
                return Ok(());
            }
            return Err(crate::Error::new_multipart(MultipartKind::MalformedBody));
        }
        // otherwise the delimiter ends its line and the next part follows
        match discriminate(buf) {
            Discriminator::Opening(consumed) => {
                buf.advance(consumed);
                self.state = State::Headers;
                Ok(())
            }
            Discriminator::NeedMore => Ok(()),
            _ => Err(crate::Error::new_multipart(MultipartKind::MalformedBody)),
        }
    }

    /// A closing delimiter: leaves a mixed group, or ends the stream.
    fn close_current(&mut self) {
        match self.outer.take() {
            Some((outer, _)) => {
                self.delimiter = outer;
                self.state = State::Boundary;
            }
            None => {
                self.state = State::Terminated;
            }
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("state", &self.state)
            .field("nested", &self.outer.is_some())
            .finish()
    }
}

enum Discriminator {
    /// CRLF or LF; `usize` is how many bytes it took.
    Opening(usize),
    /// `--`.
    Closing,
    NeedMore,
    Invalid,
}

fn discriminate(buf: &[u8]) -> Discriminator {
    match buf.first() {
        None => Discriminator::NeedMore,
        Some(b'\n') => Discriminator::Opening(1),
        Some(b'\r') => match buf.get(1) {
            None => Discriminator::NeedMore,
            Some(b'\n') => Discriminator::Opening(2),
            Some(_) => Discriminator::Invalid,
        },
        Some(b'-') => match buf.get(1) {
            None => Discriminator::NeedMore,
            Some(b'-') => Discriminator::Closing,
            Some(_) => Discriminator::Invalid,
        },
        Some(_) => Discriminator::Invalid,
    }
}

enum Scan {
    /// A line break followed by the delimiter. Data ends before the line
    /// break; decoding resumes right after the delimiter.
    Found { data_end: usize, resume: usize },
    /// No delimiter yet; everything before `emit_up_to` is certainly part
    /// data, the tail might be a split boundary.
    Safe { emit_up_to: usize },
}

/// Finds the end of a header block: the offset just past the empty line.
fn find_block_end(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\r\n") {
        return Some(2);
    }
    if buf.starts_with(b"\n") {
        return Some(1);
    }
    let mut i = 0;
    while let Some(off) = buf[i..].iter().position(|&b| b == b'\n') {
        let nl = i + off;
        match buf.get(nl + 1) {
            Some(b'\n') => return Some(nl + 2),
            Some(b'\r') if buf.get(nl + 2) == Some(&b'\n') => return Some(nl + 3),
            _ => i = nl + 1,
        }
    }
    None
}

fn scan_data(buf: &[u8], delimiter: &[u8]) -> Scan {
    let mut i = 0;
    while let Some(off) = buf[i..].iter().position(|&b| b == b'\n') {
        let nl = i + off;
        let after = nl + 1;
        let data_end = if nl > 0 && buf[nl - 1] == b'\r' {
            nl - 1
        } else {
            nl
        };
        if buf.len() >= after + delimiter.len() {
            if buf[after..after + delimiter.len()] == *delimiter {
                return Scan::Found {
                    data_end,
                    resume: after + delimiter.len(),
                };
            }
            i = after;
        } else {
            // the tail could still become this delimiter
            if delimiter.starts_with(&buf[after..]) {
                return Scan::Safe {
                    emit_up_to: data_end,
                };
            }
            i = after;
        }
    }
    // no candidate line break; hold back a trailing CR
    let emit_up_to = if buf.last() == Some(&b'\r') {
        buf.len() - 1
    } else {
        buf.len()
    };
    Scan::Safe { emit_up_to }
}

/// Pulls `name` and `filename` out of a `Content-Disposition` value.
fn parse_disposition(value: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for param in value.split(';').skip(1) {
        let mut kv = param.splitn(2, '=');
        let key = kv.next().unwrap_or("").trim();
        let raw = match kv.next() {
            Some(raw) => raw.trim(),
            None => continue,
        };
        let unquoted = raw.trim_matches('"').to_owned();
        if key.eq_ignore_ascii_case("name") {
            name = Some(unquoted);
        } else if key.eq_ignore_ascii_case("filename") {
            filename = Some(unquoted);
        }
    }
    (name, filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    fn decode_all(input: &[u8]) -> crate::Result<Vec<Event>> {
        let mut decoder = Decoder::new("----X", MultipartLimits::default());
        let mut buf = BytesMut::from(input);
        let mut events = Vec::new();
        decoder.decode(&mut buf, &mut events)?;
        decoder.finish()?;
        Ok(events)
    }

    fn part_data(events: &[Event]) -> Vec<u8> {
        let mut out = Vec::new();
        for event in events {
            if let Event::Data(b) = event {
                out.extend_from_slice(b);
            }
        }
        out
    }

    #[test]
    fn single_part() {
        // the classic one-field form
        let events = decode_all(
            b"------X\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\nhello\r\n------X--",
        )
        .unwrap();
        match &events[0] {
            Event::PartStart(head) => {
                assert_eq!(head.name, "n");
                assert!(head.filename.is_none());
            }
            other => panic!("expected part start, got {:?}", other),
        }
        assert_eq!(part_data(&events), b"hello");
        assert_matches!(events.last(), Some(Event::PartEnd));
    }

    #[test]
    fn two_parts_with_filename() {
        let events = decode_all(
            b"------X\r\n\
              Content-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
              ------X\r\n\
              Content-Disposition: form-data; name=\"f\"; filename=\"x.bin\"\r\n\
              Content-Type: application/octet-stream\r\n\r\n22\r\n\
              ------X--",
        )
        .unwrap();
        let starts: Vec<&PartHead> = events
            .iter()
            .filter_map(|e| match e {
                Event::PartStart(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0].name, "a");
        assert_eq!(starts[1].filename.as_deref(), Some("x.bin"));
        assert_eq!(
            starts[1].content_type.as_ref().unwrap().essence_str(),
            "application/octet-stream"
        );
    }

    #[test]
    fn split_boundary_across_chunks() {
        let mut decoder = Decoder::new("----X", MultipartLimits::default());
        let mut events = Vec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(
            b"------X\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\nhel",
        );
        decoder.decode(&mut buf, &mut events).unwrap();
        // the boundary arrives split in the middle
        buf.extend_from_slice(b"lo\r\n----");
        decoder.decode(&mut buf, &mut events).unwrap();
        buf.extend_from_slice(b"--X--");
        decoder.decode(&mut buf, &mut events).unwrap();
        decoder.finish().unwrap();

        assert_eq!(part_data(&events), b"hello");
    }

    #[test]
    fn data_with_inner_line_breaks() {
        let events = decode_all(
            b"------X\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\nl1\r\nl2\r\n------X--",
        )
        .unwrap();
        assert_eq!(part_data(&events), b"l1\r\nl2");
    }

    #[test]
    fn missing_disposition_is_an_error() {
        let err = decode_all(b"------X\r\nContent-Type: text/plain\r\n\r\nx\r\n------X--")
            .unwrap_err();
        assert!(err.is_multipart());
    }

    #[test]
    fn nested_mixed_one_level() {
        let events = decode_all(
            b"------X\r\n\
              Content-Disposition: form-data; name=\"files\"\r\n\
              Content-Type: multipart/mixed; boundary=IN\r\n\r\n\
              --IN\r\n\
              Content-Disposition: attachment; filename=\"a.txt\"\r\n\r\nAAA\r\n\
              --IN--\r\n\
              ------X--",
        )
        .unwrap();
        let starts: Vec<&PartHead> = events
            .iter()
            .filter_map(|e| match e {
                Event::PartStart(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(starts.len(), 1);
        // mixed entries inherit the outer field name
        assert_eq!(starts[0].name, "files");
        assert_eq!(starts[0].filename.as_deref(), Some("a.txt"));
        assert_eq!(part_data(&events), b"AAA");
    }

    #[test]
    fn deeper_nesting_fails() {
        let err = decode_all(
            b"------X\r\n\
              Content-Disposition: form-data; name=\"files\"\r\n\
              Content-Type: multipart/mixed; boundary=IN\r\n\r\n\
              --IN\r\n\
              Content-Disposition: form-data; name=\"deeper\"\r\n\
              Content-Type: multipart/mixed; boundary=DEEP\r\n\r\n\
              --DEEP--\r\n\
              --IN--\r\n\
              ------X--",
        )
        .unwrap_err();
        assert!(err.is_multipart());
    }

    #[test]
    fn part_limit_enforced() {
        let mut decoder = Decoder::new(
            "----X",
            MultipartLimits {
                max_parts: 1,
                max_part_header_bytes: 8192,
            },
        );
        let mut buf = BytesMut::from(
            &b"------X\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n\
               ------X\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\n2\r\n\
               ------X--"[..],
        );
        let mut events = Vec::new();
        let err = decoder.decode(&mut buf, &mut events).unwrap_err();
        assert!(err.is_multipart());
    }

    #[test]
    fn truncated_stream_fails_at_finish() {
        let mut decoder = Decoder::new("----X", MultipartLimits::default());
        let mut buf = BytesMut::from(
            &b"------X\r\nContent-Disposition: form-data; name=\"n\"\r\n\r\nhel"[..],
        );
        let mut events = Vec::new();
        decoder.decode(&mut buf, &mut events).unwrap();
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn empty_multipart_terminates() {
        let events = decode_all(b"------X--").unwrap();
        assert!(part_data(&events).is_empty());
        assert!(events
            .iter()
            .all(|e| !matches!(e, Event::PartStart(_))));
    }
}
