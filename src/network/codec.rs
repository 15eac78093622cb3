//! Wire Framing
//!
//! One JSON object per newline-terminated UTF-8 line. The reader buffers
//! partial frames across reads and caps frame size at [`MAX_FRAME_BYTES`];
//! an oversized frame is a fatal error for the connection, not a skipped
//! message, because the rest of the stream can no longer be trusted to
//! align with frame boundaries.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::network::protocol::Message;

/// Maximum accepted frame size (64 KiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Framing errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A frame exceeded [`MAX_FRAME_BYTES`]. Fatal for the connection.
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge,

    /// A frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// Serializing an outbound message failed.
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// The underlying transport failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads newline-delimited frames off a buffered transport.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        FrameReader { reader }
    }

    /// The next complete frame, without its terminator. `None` on a clean
    /// end of stream; a partial trailing frame is discarded with it.
    pub async fn next_frame(&mut self) -> Result<Option<String>, CodecError> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let (consumed, complete) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok(None);
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        if line.len() + pos > MAX_FRAME_BYTES {
                            return Err(CodecError::FrameTooLarge);
                        }
                        line.extend_from_slice(&available[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        if line.len() + available.len() > MAX_FRAME_BYTES {
                            return Err(CodecError::FrameTooLarge);
                        }
                        line.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);
            if complete {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let text = String::from_utf8(line).map_err(|_| CodecError::InvalidUtf8)?;
                return Ok(Some(text));
            }
        }
    }
}

/// Serialize one message, terminate it with `\n`, and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), CodecError> {
    let mut payload = serde_json::to_vec(msg)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
