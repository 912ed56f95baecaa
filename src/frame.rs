//! Wire frame codec.
//!
//! One frame is `[u32 big-endian header_len][header JSON][payload]`. The
//! header is a compact JSON object; `comp_len` announces the payload length
//! that follows. Both ends must agree on this layout bit-for-bit.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::validate::{self, ValidationError};

/// Hard cap on the announced header length. A hostile or garbled peer must
/// not be able to trigger an unbounded allocation.
pub const MAX_HEADER_LEN: usize = 10 * 1024;
/// Hard cap on the announced payload length.
pub const MAX_PAYLOAD_LEN: usize = 100 * 1024 * 1024;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("i/o error while reading frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("header JSON serialization failed: {0}")]
    HeaderJson(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Frame header as it appears on the wire.
///
/// Optional fields deserialize to `None` (or `""` for `dict_id`) when a
/// peer omits them; required fields missing from the JSON fail decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub v: u32,
    pub topic: String,
    pub codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    #[serde(default)]
    pub dict_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    pub count: u64,
    pub raw_len: u64,
    pub comp_len: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t0: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t1: Option<f64>,
}

impl FrameHeader {
    /// Structural validation beyond what serde enforces: version, topic
    /// rules, count >= 1, dict id charset, payload cap.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.v != PROTOCOL_VERSION {
            return Err(ValidationError::UnsupportedVersion(self.v));
        }
        validate::topic(&self.topic)?;
        if self.count == 0 {
            return Err(ValidationError::ZeroCount);
        }
        validate::dict_id(&self.dict_id)?;
        // raw_len bounds the decompression allocation, so it gets the same cap.
        for len in [self.comp_len, self.raw_len] {
            if len as usize > MAX_PAYLOAD_LEN {
                return Err(ValidationError::PayloadTooLarge {
                    got: len as usize,
                    cap: MAX_PAYLOAD_LEN,
                });
            }
        }
        Ok(())
    }
}

/// Encode a frame. `header.comp_len` must already equal `payload.len()`;
/// the encoder trusts the header because the agent builds it from the
/// actual produced lengths.
pub fn encode(header: &FrameHeader, payload: &[u8]) -> Result<Bytes, FrameError> {
    let header_json = serde_json::to_vec(header)?;
    debug_assert_eq!(header.comp_len as usize, payload.len());
    let mut buf = BytesMut::with_capacity(4 + header_json.len() + payload.len());
    buf.put_u32(header_json.len() as u32);
    buf.put_slice(&header_json);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF before the first byte
/// of the length prefix — that is how a pooled peer closes between frames.
/// EOF anywhere else is an error.
pub async fn read<S>(stream: &mut S) -> Result<Option<(FrameHeader, Bytes)>, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside frame length prefix",
            )));
        }
        filled += n;
    }

    let header_len = u32::from_be_bytes(len_buf) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(ValidationError::HeaderTooLarge { got: header_len, cap: MAX_HEADER_LEN }.into());
    }

    let mut header_buf = vec![0u8; header_len];
    stream.read_exact(&mut header_buf).await?;
    // Malformed or incomplete header JSON from a peer is a validation
    // failure, same class as a bad topic or version.
    let header: FrameHeader = serde_json::from_slice(&header_buf)
        .map_err(|e| ValidationError::Header(e.to_string()))?;
    header.validate()?;

    let mut payload = vec![0u8; header.comp_len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some((header, Bytes::from(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload_len: usize) -> FrameHeader {
        FrameHeader {
            v: PROTOCOL_VERSION,
            topic: "files.json".to_string(),
            codec: "none".to_string(),
            level: None,
            dict_id: String::new(),
            schema_id: Some("s1".to_string()),
            count: 3,
            raw_len: payload_len as u64,
            comp_len: payload_len as u64,
            t0: Some(1_700_000_000.0),
            t1: Some(1_700_000_000.5),
        }
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let payload = b"a\nb\nc\n";
        let frame = encode(&header(payload.len()), payload).unwrap();

        let mut reader: &[u8] = &frame;
        let (decoded, body) = read(&mut reader).await.unwrap().expect("one frame");
        assert_eq!(decoded.topic, "files.json");
        assert_eq!(decoded.count, 3);
        assert_eq!(decoded.comp_len, payload.len() as u64);
        assert_eq!(&body[..], payload);

        // Nothing after the frame: clean EOF.
        assert!(read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut reader: &[u8] = &[];
        assert!(read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_header_length() {
        let announced = (MAX_HEADER_LEN as u32 + 1).to_be_bytes();
        let mut reader: &[u8] = &announced;
        let err = read(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Validation(ValidationError::HeaderTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_header_missing_raw_len() {
        let json = br#"{"v":1,"topic":"t","codec":"none","count":1,"comp_len":0}"#;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
        buf.extend_from_slice(json);
        let mut reader: &[u8] = &buf;
        assert!(matches!(
            read(&mut reader).await.unwrap_err(),
            FrameError::Validation(ValidationError::Header(_))
        ));
    }

    #[tokio::test]
    async fn rejects_header_that_is_not_json() {
        let garbage = b"not json at all";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        buf.extend_from_slice(garbage);
        let mut reader: &[u8] = &buf;
        assert!(matches!(
            read(&mut reader).await.unwrap_err(),
            FrameError::Validation(ValidationError::Header(_))
        ));
    }

    #[tokio::test]
    async fn rejects_wrong_version_and_bad_topic() {
        for (v, topic) in [(2u32, "ok.topic"), (1, "../bad")] {
            let json = format!(
                r#"{{"v":{v},"topic":"{topic}","codec":"none","count":1,"raw_len":0,"comp_len":0}}"#
            );
            let mut buf = Vec::new();
            buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
            buf.extend_from_slice(json.as_bytes());
            let mut reader: &[u8] = &buf;
            assert!(matches!(read(&mut reader).await.unwrap_err(), FrameError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let payload = b"abcdef";
        let frame = encode(&header(payload.len()), payload).unwrap();
        let mut reader: &[u8] = &frame[..frame.len() - 2];
        assert!(matches!(read(&mut reader).await.unwrap_err(), FrameError::Io(_)));
    }
}
