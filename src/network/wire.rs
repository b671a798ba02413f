//! Length-prefixed bincode wire protocol between relays and core nodes.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode payload]
//! Maximum frame size: 4MB

use crate::constants::network::MAX_FRAME_SIZE;
use crate::error::WireError;
use crate::network::message::WireMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Serialize a WireMessage and write it as a length-prefixed frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> Result<(), WireError> {
    let payload = bincode::serialize(message).map_err(|e| WireError::Encode(e.to_string()))?;

    if payload.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(WireError::FrameTooLarge {
            size: payload.len() as u64,
            max: MAX_FRAME_SIZE,
        });
    }
    let len = payload.len() as u32;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame and deserialize it.
/// Returns Ok(None) on clean EOF (connection closed).
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<WireMessage>, WireError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: len as u64,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    let message: WireMessage =
        bincode::deserialize(&payload).map_err(|e| WireError::Decode(e.to_string()))?;
    Ok(Some(message))
}

/// Read one frame, treating EOF as a closed connection.
pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<WireMessage, WireError> {
    read_message(reader).await?.ok_or(WireError::Closed)
}
