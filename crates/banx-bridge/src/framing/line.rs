//! Newline framing over arbitrary byte chunks.
//!
//! Lines are terminated by `\n` or `\r\n`, in any mixture. Emitted lines keep
//! their terminator bytes; callers that want bare content use
//! [`trim_line_end`]. There is no line length limit, so a producer that never
//! writes a terminator grows the buffer without bound.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Line decoder for use with `FramedRead`.
///
/// `decode_eof` flushes unterminated trailing bytes as one final frame.
#[derive(Debug, Clone, Default)]
pub struct LineCodec {
    /// How far into the buffer we already know there is no `\n`.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split the earliest complete line (terminator included) off `src`.
    ///
    /// `\r\n` ends in `\n`, so the first `\n` always closes the earliest line
    /// whichever terminator was used. A trailing lone `\r` waits for more data.
    pub fn next_line(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        let scan_from = self.next_index.min(src.len());
        match src[scan_from..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                self.next_index = 0;
                Some(src.split_to(scan_from + offset + 1).freeze())
            }
            None => {
                self.next_index = src.len();
                None
            }
        }
    }

    /// Take whatever is left in `src` as a final unterminated frame.
    pub fn remainder(&mut self, src: &mut BytesMut) -> Option<Bytes> {
        self.next_index = 0;
        if src.is_empty() {
            None
        } else {
            Some(src.split().freeze())
        }
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.next_line(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.next_line(src) {
            Some(line) => Ok(Some(line)),
            None => Ok(self.remainder(src)),
        }
    }
}

/// Push-style framer: feed chunks in, get complete lines out.
#[derive(Debug, Default)]
pub struct LineFramer {
    codec: LineCodec,
    buf: BytesMut,
    closed: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed, in arrival order.
    ///
    /// Chunks fed after [`close`](Self::close) are ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        if self.closed {
            tracing::debug!(len = chunk.len(), "Dropping chunk fed to closed framer");
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line) = self.codec.next_line(&mut self.buf) {
            lines.push(line);
        }
        lines
    }

    /// Finish the stream, returning residual bytes as one final frame.
    ///
    /// Returns `None` when nothing is buffered or the framer is already closed.
    pub fn close(&mut self) -> Option<Bytes> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.codec.remainder(&mut self.buf)
    }

    /// Bytes received but not yet part of a terminated line.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Strip a trailing `\n` or `\r\n` from a line.
pub fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
