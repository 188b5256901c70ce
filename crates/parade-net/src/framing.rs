//! Length-prefixed framing for stream transports.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The prefix does not count itself. A zero-length frame is valid. Handshake
//! frames carry postcard-encoded structs via [`read_typed`] / [`write_typed`];
//! everything after the handshake is an opaque envelope.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single frame payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 1_048_576;

/// Framing limits.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Largest payload accepted or produced, in bytes.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl FrameConfig {
    fn check(&self, size: usize) -> Result<u32, FrameError> {
        match u32::try_from(size) {
            Ok(len) if len <= self.max_payload_size => Ok(len),
            _ => Err(FrameError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            }),
        }
    }
}

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Frame larger than [`FrameConfig::max_payload_size`].
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Offending size.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// The stream ended before a whole frame arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// A typed frame did not hold the expected structure.
    #[error("frame codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ConnectionClosed
        } else {
            FrameError::Io(e)
        }
    }
}

/// Read one frame and return its payload.
pub async fn read_frame<R>(reader: &mut R, config: &FrameConfig) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;

    let len = u32::from_le_bytes(prefix) as usize;
    config.check(len)?;

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(payload)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = config.check(payload.len())?;
    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read a frame holding a postcard-encoded `T`.
pub async fn read_typed<T, R>(reader: &mut R, config: &FrameConfig) -> Result<T, FrameError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let bytes = read_frame(reader, config).await?;
    Ok(postcard::from_bytes(&bytes)?)
}

/// Write `value` as a postcard-encoded frame.
pub async fn write_typed<T, W>(
    writer: &mut W,
    value: &T,
    config: &FrameConfig,
) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = postcard::to_allocvec(value)?;
    write_frame(writer, &bytes, config).await
}
