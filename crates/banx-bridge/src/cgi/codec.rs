//! CGI output decoding: a header block, a blank line, then a raw body.

use std::mem;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::framing::{LineCodec, trim_line_end};

use super::CgiError;

/// Ordered CGI response headers with trimmed values.
///
/// Names compare ASCII case-insensitively; a repeated name replaces the earlier
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiHeaders {
    entries: Vec<(String, String)>,
}

impl CgiHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One decoded unit of CGI output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgiFrame {
    /// The complete header block. Emitted exactly once, before any body.
    Headers(CgiHeaders),
    /// Body bytes, passed through as they arrive.
    Body(Bytes),
}

/// Decoder that collects header lines up to the first blank line, then
/// switches to pass-through for the body.
#[derive(Debug, Default)]
pub struct CgiCodec {
    lines: LineCodec,
    headers: CgiHeaders,
    in_body: bool,
}

impl CgiCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the header block has been emitted.
    pub fn in_body(&self) -> bool {
        self.in_body
    }

    fn header_line(&mut self, line: &[u8]) -> Result<Option<CgiFrame>, CgiError> {
        if line.trim_ascii().is_empty() {
            self.in_body = true;
            return Ok(Some(CgiFrame::Headers(mem::take(&mut self.headers))));
        }
        let (name, value) = parse_header_line(line)?;
        self.headers.insert(name, value);
        Ok(None)
    }
}

impl Decoder for CgiCodec {
    type Item = CgiFrame;
    type Error = CgiError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.in_body {
            if src.is_empty() {
                return Ok(None);
            }
            return Ok(Some(CgiFrame::Body(src.split().freeze())));
        }
        while let Some(line) = self.lines.next_line(src) {
            if let Some(frame) = self.header_line(&line)? {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !self.in_body
            && let Some(rest) = self.lines.remainder(src)
        {
            return self.header_line(&rest);
        }
        Ok(None)
    }
}

/// Parse `Name: value`, trimming the value. Names are restricted to ASCII
/// letters, digits and `-`.
fn parse_header_line(line: &[u8]) -> Result<(String, String), CgiError> {
    let text = String::from_utf8_lossy(trim_line_end(line));
    let malformed = || CgiError::MalformedHeader(text.to_string());

    let (name, value) = text.split_once(':').ok_or_else(malformed)?;
    let name = name.trim();
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(malformed());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn header(name: &str, value: &str) -> String {
        format!("{name}: {value}\r\n")
    }

    fn decode_all(codec: &mut CgiCodec, buf: &mut BytesMut) -> Vec<CgiFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn emits_headers_after_first_blank_line() {
        let mut codec = CgiCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(header("Expires", "Fri, 01 Jan 1980 00:00:00 GMT").as_bytes());
        buf.extend_from_slice(header("Pragma", "no-cache").as_bytes());
        assert!(decode_all(&mut codec, &mut buf).is_empty());
        assert!(!codec.in_body());

        buf.extend_from_slice(b"\n");
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 1);
        let CgiFrame::Headers(headers) = &frames[0] else {
            panic!("expected headers, got {:?}", frames[0]);
        };
        assert_eq!(headers.get("Expires"), Some("Fri, 01 Jan 1980 00:00:00 GMT"));
        assert_eq!(headers.get("Pragma"), Some("no-cache"));
        assert!(codec.in_body());
    }

    #[test]
    fn passes_body_through_after_headers() {
        let mut codec = CgiCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(header("Content-Type", "text/plain").as_bytes());
        buf.extend_from_slice(b"\r\n59e91bb8090706a9ad5960c4486749d4d4886224\trefs/heads/master\n");

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], CgiFrame::Headers(h) if h.get("content-type") == Some("text/plain")));
        assert_eq!(
            frames[1],
            CgiFrame::Body(Bytes::from_static(
                b"59e91bb8090706a9ad5960c4486749d4d4886224\trefs/heads/master\n"
            ))
        );
    }

    #[test]
    fn body_is_not_line_framed() {
        let mut codec = CgiCodec::new();
        let mut buf = BytesMut::from(&b"\r\nno newline"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], CgiFrame::Body(Bytes::from_static(b"no newline")));

        buf.extend_from_slice(b"\r\x00binary");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(CgiFrame::Body(Bytes::from_static(b"\r\x00binary")))
        );
    }

    #[test]
    fn whitespace_only_line_ends_headers() {
        let mut codec = CgiCodec::new();
        let mut buf = BytesMut::from(&b"Status: 204\r\n \t\r\n"[..]);
        let frames = decode_all(&mut codec, &mut buf);
        assert!(matches!(&frames[0], CgiFrame::Headers(h) if h.get("Status") == Some("204")));
    }

    #[test]
    fn malformed_header_is_an_error() {
        let mut codec = CgiCodec::new();
        let mut buf = BytesMut::from(&b"this is not a header\r\n\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CgiError::MalformedHeader(ref line) if line == "this is not a header"));
    }

    #[test]
    fn header_name_is_letters_digits_and_dashes() {
        assert!(parse_header_line(b"Bad Name: x\r\n").is_err());
        assert!(parse_header_line(b": x\r\n").is_err());
        assert!(parse_header_line(b"X_Git_Ref: x\r\n").is_err());
        assert!(parse_header_line(b"X.Ref: x\r\n").is_err());
        assert_eq!(
            parse_header_line(b"X-Git-Ref:  refs/heads/main  \n").unwrap(),
            ("X-Git-Ref".to_string(), "refs/heads/main".to_string())
        );
        // Only the first colon separates.
        assert_eq!(
            parse_header_line(b"Location: http://example.com:80/\n").unwrap(),
            ("Location".to_string(), "http://example.com:80/".to_string())
        );
    }

    #[test]
    fn repeated_header_replaces_in_place() {
        let mut headers = CgiHeaders::new();
        headers.insert("Cache-Control", "no-cache");
        headers.insert("Pragma", "no-cache");
        headers.insert("cache-control", "max-age=0");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(
            collected,
            [("Cache-Control", "max-age=0"), ("Pragma", "no-cache")]
        );
        assert_eq!(headers.remove("CACHE-CONTROL").as_deref(), Some("max-age=0"));
        assert_eq!(headers.len(), 1);
    }

    #[tokio::test]
    async fn flushes_remaining_body_at_eof() {
        let input: &[u8] =
            b"Content-Length: 59\r\n\n59e91bb8090706a9ad5960c4486749d4d4886224\trefs/heads/master";
        let frames: Vec<CgiFrame> = FramedRead::new(input, CgiCodec::new())
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], CgiFrame::Headers(h) if h.get("Content-Length") == Some("59")));
        assert_eq!(
            frames[1],
            CgiFrame::Body(Bytes::from_static(
                b"59e91bb8090706a9ad5960c4486749d4d4886224\trefs/heads/master"
            ))
        );
    }

    #[tokio::test]
    async fn stream_without_blank_line_yields_no_headers() {
        let input: &[u8] = b"Content-Type: text/plain\r\nStatus: 500";
        let frames: Vec<_> = FramedRead::new(input, CgiCodec::new()).collect().await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn malformed_trailing_header_at_eof_is_an_error() {
        let input: &[u8] = b"Content-Type: text/plain\r\ngarbage";
        let frames: Vec<_> = FramedRead::new(input, CgiCodec::new()).collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(CgiError::MalformedHeader(_))));
    }
}
