//! Length-prefixed JSON framing for the control stream.
//!
//! Wire format: `[4-byte big-endian length][JSON payload]`

use crate::error::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's payload. Anything larger is treated as a
/// malformed stream and the connection is closed.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Encode a serializable value into a length-prefixed JSON frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> TetherResult<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(|e| TetherError::Codec(e.to_string()))?;
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Read one frame payload from the stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. A length prefix
/// above [`MAX_FRAME_LEN`] or a truncated payload is a codec error.
pub async fn read_frame<R>(reader: &mut R) -> TetherResult<Option<Vec<u8>>>
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
    if len > MAX_FRAME_LEN {
        return Err(TetherError::Codec(format!("frame length {len} exceeds cap")));
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| TetherError::Codec(format!("truncated frame: {e}")))?;
    Ok(Some(payload))
}

/// Encode and write one frame to the stream.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> TetherResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a JSON frame payload into a typed value.
pub fn json_decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> TetherResult<T> {
    serde_json::from_slice(payload).map_err(|e| TetherError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[tokio::test]
    async fn round_trip_single() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &msg).await.unwrap();
        let payload = read_frame(&mut server).await.unwrap().unwrap();
        let decoded: TestMsg = json_decode(&payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn round_trip_multiple() {
        let msgs = vec![
            TestMsg {
                name: "a".into(),
                value: 1,
            },
            TestMsg {
                name: "b".into(),
                value: 2,
            },
        ];
        let (mut client, mut server) = tokio::io::duplex(1024);
        for m in &msgs {
            write_frame(&mut client, m).await.unwrap();
        }
        drop(client);
        let mut decoded = Vec::new();
        while let Some(payload) = read_frame(&mut server).await.unwrap() {
            decoded.push(json_decode::<TestMsg>(&payload).unwrap());
        }
        assert_eq!(decoded, msgs);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_payload_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frame = frame_encode(&TestMsg {
            name: "x".into(),
            value: 0,
        })
        .unwrap();
        client.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn oversized_length_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }
}
