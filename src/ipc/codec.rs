//! Frame codec for the worker wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬────────────────────────┐
//! │ len (4B) │   JSON message body    │
//! │ u32 BE   │                        │
//! └──────────┴────────────────────────┘
//! ```
//! Length covers the body only, NOT the 4-byte prefix.

use std::io::{Error, ErrorKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Read one frame body from the stream.
///
/// Returns `None` on clean EOF (no bytes of a new frame read). A stream that
/// ends inside the prefix or the body is `InvalidData`, as is a frame larger
/// than `max_frame_bytes`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_BYTES {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("truncated length prefix: {} of 4 bytes", filled),
            ));
        }
        filled += n;
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "frame too large: {} bytes (limit {})",
                frame_len, max_frame_bytes
            ),
        ));
    }

    let mut body = vec![0u8; frame_len as usize];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::new(
            ErrorKind::InvalidData,
            format!("truncated payload: expected {} bytes", frame_len),
        )),
        Err(e) => Err(e),
    }
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(body.len())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "frame body exceeds u32 length"))?;
    // One buffer so a frame is a single write on the pipe.
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&frame_len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"{\"x\":1}").await.unwrap();
        let body = read_frame(&mut b, 1024).await.unwrap().unwrap();
        assert_eq!(body, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_prefix_is_invalid_data() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_invalid_data() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("truncated payload"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&4096u32.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_empty_body_allowed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"").await.unwrap();
        assert_eq!(read_frame(&mut b, 16).await.unwrap(), Some(Vec::new()));
    }
}
