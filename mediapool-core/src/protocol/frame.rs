//! Length prefixed frames: `kind(u8) || length(u32 BE) || payload`.

use crate::{PoolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Unencrypted JSON; only accepted for handshakes and unreadable-key errors.
    Plain = 0,
    /// JSON sealed to the recipient's public key.
    Sealed = 1,
}

impl FrameKind {
    fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Plain),
            1 => Ok(FrameKind::Sealed),
            other => Err(PoolError::Protocol(format!("unknown frame kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn plain(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Plain,
            payload,
        }
    }

    pub fn sealed(payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Sealed,
            payload,
        }
    }
}

pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind = FrameKind::from_byte(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    if len > max_frame_bytes {
        return Err(PoolError::Protocol(format!(
            "frame of {} bytes exceeds the maximum of {} bytes",
            len, max_frame_bytes
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(frame.payload.len()).map_err(|_| {
        PoolError::Protocol(format!("frame of {} bytes is too large", frame.payload.len()))
    })?;

    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = frame.kind as u8;
    header[1..].copy_from_slice(&len.to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}
