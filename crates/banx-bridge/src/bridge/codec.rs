//! Framed codec for worker communication.
//!
//! Uses LineCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::framing::{LineCodec, trim_line_end};

/// Codec that frames messages as newline-terminated JSON.
///
/// Lines that are blank or fail to parse as `T` are skipped, never surfaced as
/// errors.
pub struct JsonLineCodec<T> {
    inner: LineCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LineCodec::new(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JsonLineCodec<T> {
    fn parse(line: &[u8]) -> Option<T> {
        let line = trim_line_end(line).trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice(line) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    line = %String::from_utf8_lossy(line),
                    "Ignoring unparseable line"
                );
                None
            }
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.next_line(src) {
            if let Some(item) = Self::parse(&line) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        Ok(self
            .inner
            .remainder(src)
            .and_then(|line| Self::parse(&line)))
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{MsgId, WorkerRequest, WorkerResponse};
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn encodes_one_json_object_per_line() {
        let mut codec = JsonLineCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let req = WorkerRequest {
            msg_id: MsgId::new("id-1"),
            code: "a = 1\nb = 2".to_string(),
        };
        codec.encode(req, &mut buf).unwrap();

        assert_eq!(&buf[..], b"{\"msgId\":\"id-1\",\"code\":\"a = 1\\nb = 2\"}\n");
    }

    #[test]
    fn decodes_response_split_across_chunks() {
        let mut codec = JsonLineCodec::<WorkerResponse>::new();
        let mut buf = BytesMut::from(&b"{\"msgId\":\"id-1\",\"err"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"or\":false,\"result\":{\"x\":1}}\r\n");
        let resp = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(resp.msg_id, MsgId::new("id-1"));
        assert_eq!(resp.result["x"], 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn skips_garbage_and_blank_lines() {
        let mut codec = JsonLineCodec::<WorkerResponse>::new();
        let mut buf = BytesMut::from(
            &b"Loading sage...\n\n{\"no\":\"id\"}\n{\"msgId\":\"ok\",\"error\":false,\"result\":{}}\n"[..],
        );

        let resp = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(resp.msg_id, MsgId::new("ok"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn decodes_unterminated_final_response_at_eof() {
        let input: &[u8] = b"noise\n{\"msgId\":\"last\",\"error\":true,\"result\":\"boom\"}";
        let responses: Vec<WorkerResponse> =
            FramedRead::new(input, JsonLineCodec::<WorkerResponse>::new())
                .map(|r| r.unwrap())
                .collect()
                .await;

        assert_eq!(responses.len(), 1);
        assert!(responses[0].error);
        assert_eq!(responses[0].error_message(), "boom");
    }
}
