//! Frame Codec (spec §4.A) — 4-byte big-endian length-prefixed UTF-8 JSON
//! payloads over a bidirectional byte stream.
//!
//! ```text
//! frame   := length(4 bytes, big-endian uint32) || payload
//! payload := utf-8 bytes of one JSON value
//! length  := byte count of payload; 1 <= length <= 10_485_760
//! ```
//!
//! Decoding never blocks after the length prefix is known except to
//! complete the payload read; a short read at any point is reported as
//! [`FrameError::UnexpectedEof`], distinct from a malformed frame.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Maximum payload size: 10 MiB, per spec.
pub const MAX_PAYLOAD_BYTES: u32 = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload of {0} bytes exceeds the 10MiB limit")]
    TooLarge(u32),

    #[error("frame declared a zero-length payload")]
    ZeroLength,

    #[error("stream ended before a full frame was read")]
    UnexpectedEof,

    #[error("payload was not valid UTF-8 JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode one JSON value as a length-prefixed frame and write it to `out`.
///
/// Fails with [`FrameError::TooLarge`] if the encoded payload exceeds
/// [`MAX_PAYLOAD_BYTES`]; never partially writes a frame that failed this
/// check (the length check happens before any bytes hit the stream).
pub async fn encode<W: AsyncWrite + Unpin>(out: &mut W, value: &Value) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(value)?;
    let len = payload.len();
    if len == 0 {
        return Err(FrameError::ZeroLength);
    }
    if len as u64 > MAX_PAYLOAD_BYTES as u64 {
        return Err(FrameError::TooLarge(len as u32));
    }
    let len = len as u32;

    out.write_all(&len.to_be_bytes()).await?;
    out.write_all(&payload).await?;
    out.flush().await?;
    Ok(())
}

/// Read exactly one frame from `input` and parse its payload as JSON.
///
/// A clean EOF before any bytes of the length prefix are read is reported
/// as [`FrameError::UnexpectedEof`] (the caller should treat this as
/// "connection closed", not a protocol violation) — the same is true for a
/// short read mid-payload.
pub async fn decode<R: AsyncRead + Unpin>(input: &mut R) -> Result<Value, FrameError> {
    let mut len_bytes = [0u8; 4];
    read_exact_or_eof(input, &mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);

    if len == 0 {
        return Err(FrameError::ZeroLength);
    }
    if len > MAX_PAYLOAD_BYTES {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    input
        .read_exact(&mut payload)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
            _ => FrameError::Io(e),
        })?;

    let value = serde_json::from_slice(&payload)?;
    Ok(value)
}

/// Like [`tokio::io::AsyncReadExt::read_exact`], but treats an EOF that
/// occurs before any byte has been read as [`FrameError::UnexpectedEof`]
/// rather than a generic I/O error, so callers can distinguish "stream
/// closed between frames" from "stream closed mid-frame" if they want to
/// (both currently map to the same variant, kept distinct at the call site
/// in [`decode`] for the length prefix specifically).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    input: &mut R,
    buf: &mut [u8],
) -> Result<(), FrameError> {
    input.read_exact(buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof,
        _ => FrameError::Io(e),
    })
}

/// Serializes concurrent frame writes to a single output stream so that a
/// partially written frame is never interleaved with another's bytes
/// (spec §4.A). Wrap the writer half of a plugin's stdio/stdin/stdout pipe
/// in this once and hand out clones of the `Arc` rather than the raw
/// writer.
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    pub async fn send(&self, value: &Value) -> Result<(), FrameError> {
        let mut writer = self.inner.lock().await;
        encode(&mut *writer, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trips_a_small_value() {
        let value = serde_json::json!({"jsonrpc": "2.0", "method": "ping"});
        let mut buf = Vec::new();
        encode(&mut buf, &value).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded = decode(&mut cursor).await.unwrap();
        assert_eq!(decoded, value);
    }

    #[tokio::test]
    async fn rejects_payload_over_the_limit() {
        let huge = serde_json::Value::String("x".repeat(MAX_PAYLOAD_BYTES as usize + 1));
        let mut buf = Vec::new();
        let err = encode(&mut buf, &huge).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn decode_at_exactly_the_limit_succeeds() {
        // 10MiB JSON string literal leaves room for the two quote bytes.
        let payload_len = MAX_PAYLOAD_BYTES as usize;
        let inner_len = payload_len - 2;
        let huge = serde_json::Value::String("x".repeat(inner_len));
        let mut buf = Vec::new();
        encode(&mut buf, &huge).await.unwrap();
        assert_eq!(buf.len() as u32 - 4, MAX_PAYLOAD_BYTES);

        let mut cursor = Cursor::new(buf);
        let decoded = decode(&mut cursor).await.unwrap();
        assert_eq!(decoded, huge);
    }

    #[tokio::test]
    async fn decode_reports_eof_distinctly_from_malformed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedEof));
    }

    #[tokio::test]
    async fn decode_rejects_zero_length() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        let err = decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::ZeroLength));
    }

    #[tokio::test]
    async fn decode_rejects_oversized_declared_length() {
        let mut bytes = (MAX_PAYLOAD_BYTES + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let mut cursor = Cursor::new(bytes);
        let err = decode(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[tokio::test]
    async fn writer_serializes_concurrent_sends() {
        let buf: Vec<u8> = Vec::new();
        let writer = std::sync::Arc::new(FrameWriter::new(Cursor::new(buf)));
        let a = std::sync::Arc::clone(&writer);
        let b = std::sync::Arc::clone(&writer);
        let (r1, r2) = tokio::join!(
            a.send(&serde_json::json!({"n": 1})),
            b.send(&serde_json::json!({"n": 2}))
        );
        r1.unwrap();
        r2.unwrap();
    }
}
