//! Length-prefixed frame codec.
//!
//! ```text
//! ┌────────────────────┬──────────────────────┐
//! │ len: i32 (BE)      │ payload: len bytes   │
//! └────────────────────┴──────────────────────┘
//! ```
//!
//! A non-positive or oversized length is a protocol violation; the caller
//! closes the connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid frame length {0}")]
    InvalidLength(i32),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Connection closed mid-frame ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },
}

impl FrameError {
    /// Whether the peer broke the framing rules, as opposed to the
    /// connection failing.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::InvalidLength(_) | Self::TooLarge { .. })
    }
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Read one frame. Returns `Ok(None)` on a clean EOF before any header byte.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> FrameResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                expected: HEADER_LEN,
                received: filled,
            });
        }
        filled += n;
    }

    let declared = i32::from_be_bytes(header);
    if declared <= 0 {
        return Err(FrameError::InvalidLength(declared));
    }
    let len = declared as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    let mut received = 0;
    while received < len {
        let n = reader.read(&mut payload[received..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: len,
                received,
            });
        }
        received += n;
    }
    Ok(Some(payload))
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> FrameResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(FrameError::InvalidLength(0));
    }
    let len = i32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: i32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
