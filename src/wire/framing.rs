//! 4-byte big-endian length-delimited message framing (§6)
//!
//! Both the tracker wire protocol (over TLS) and the peer wire protocol
//! (over the UTP substrate) use the same envelope: a 4-byte big-endian
//! length prefix followed by that many bytes of protobuf-encoded message.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected outright; guards against a corrupt
/// or hostile length prefix forcing an unbounded allocation.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub async fn write_frame<W, M>(writer: &mut W, message: &M) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .expect("Vec<u8> grows to fit any encoded length");
    writer.write_all(&(buf.len() as u32).to_be_bytes()).await?;
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn read_frame<R, M>(reader: &mut R) -> std::io::Result<M>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum of {MAX_FRAME_LEN}"),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    M::decode(buf.as_slice()).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::peer::{OuterMessage, OuterType};

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let message = OuterMessage {
            r#type: OuterType::Alive as i32,
            payload: None,
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &message).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: OuterMessage = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.r#type, OuterType::Alive as i32);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length_prefix() {
        let mut cursor = std::io::Cursor::new((MAX_FRAME_LEN + 1).to_be_bytes().to_vec());
        let result: std::io::Result<OuterMessage> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_frame_rejects_truncated_body() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(buf);
        let result: std::io::Result<OuterMessage> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
