//! Frame codec.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a JSON
//! document:
//!
//! ```text
//! ┌──────────────┬────────────────────────────────────────┐
//! │ len: u32 BE  │ {"frame":"message","envelope":{...}}   │
//! └──────────────┴────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Result, TransportError};
use crate::address::Uid;
use crate::envelope::Envelope;

/// A unit of transmission on a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum Frame {
    /// First frame in each direction: who is on the other end.
    Hello { uid: Uid, address: PathBuf },
    /// An application message.
    Message { envelope: Envelope },
}

/// Encode `frame` with its length prefix.
pub fn encode(frame: &Frame, max_len: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(frame)?;
    if json.len() > max_len || json.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            len: json.len(),
            max: max_len,
        });
    }

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(TransportError::FrameTooLarge { len, max: max_len });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Encode and write one frame, flushing afterwards.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(frame, max_len)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hello_then_message_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let hello = Frame::Hello {
            uid: Uid::Num(3),
            address: PathBuf::from("/tmp/ns-3.sock"),
        };
        let msg = Frame::Message {
            envelope: Envelope::stamped("ping", json!({"n": 1}), &Uid::Num(3)),
        };

        write_frame(&mut a, &hello, 1024).await.unwrap();
        write_frame(&mut a, &msg, 1024).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), Some(hello));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), Some(msg));
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), None);
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let frame = Frame::Message {
            envelope: Envelope::stamped("big", json!({"pad": "x".repeat(64)}), &Uid::Num(1)),
        };
        let err = encode(&frame, 16).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_length_prefix() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 1_000_000, .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{\"fr").await.unwrap();
        drop(a);

        assert!(read_frame(&mut b, 1024).await.is_err());
    }

    #[test]
    fn test_wire_tag() {
        let frame = Frame::Hello {
            uid: Uid::from("w"),
            address: PathBuf::from("/tmp/ns-w.sock"),
        };
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"frame": "hello", "uid": "w", "address": "/tmp/ns-w.sock"})
        );
    }
}
