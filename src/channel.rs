//! A communication channel used to send/receive messages to/from another party.
//!
//! Every message is serialized and split into blocks of at most [`BLOCK_SIZE`] bytes. Each
//! block is deflate-compressed on its own and written as
//!
//! ```text
//! compressedLength: u32 BE | rawLength: u32 BE | compressed bytes
//! ```
//!
//! A message ends with an empty block header `(0, 0)`. Compressing block by block bounds the
//! memory needed for a single block independently of the size of the message.

use std::io::{Read, Write};

use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// The maximum number of uncompressed payload bytes in a single block.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// The maximum size of a serialized message, larger messages are rejected on both ends.
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

/// Upper bound for the compressed size of a full block (deflate stored blocks add 5 bytes
/// per 16 KiB, we leave some room for the stream header).
const MAX_COMPRESSED_BLOCK: usize = BLOCK_SIZE + BLOCK_SIZE / 16 + 64;

const HEADER_LEN: usize = 8;

/// Errors related to sending / receiving / (de-)serializing messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream was closed before the first byte of a message.
    #[error("connection closed by peer")]
    Closed,
    /// The stream was closed while a message was only partially received.
    #[error("connection closed in the middle of a message")]
    Truncated,
    /// A block header or block body is not valid.
    #[error("malformed block: {0}")]
    MalformedBlock(String),
    /// The message is larger than [`MAX_MESSAGE_SIZE`].
    #[error("message exceeds the maximum size of {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,
    /// The message could not be serialized (before sending it out).
    #[error("unable to serialize message")]
    Encode(#[source] bincode::Error),
    /// The received payload is not a valid message.
    #[error("unable to deserialize message")]
    Decode(#[source] bincode::Error),
    /// The underlying stream failed.
    #[error("transport io error")]
    Io(#[from] std::io::Error),
}

/// A wrapper around a byte stream that takes care of framing and (de-)serializing messages.
#[derive(Debug)]
pub struct MsgChannel<S>(pub S);

impl<S> MsgChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Serializes and sends a message.
    pub async fn send(&mut self, msg: &impl Serialize) -> Result<(), FrameError> {
        write_message(&mut self.0, msg, |_, _| {}).await
    }

    /// Serializes and sends a message, calling `progress(written, total)` after every block.
    pub async fn send_with_progress(
        &mut self,
        msg: &impl Serialize,
        progress: impl FnMut(usize, usize),
    ) -> Result<(), FrameError> {
        write_message(&mut self.0, msg, progress).await
    }

    /// Waits until one complete message is available and deserializes it.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        read_message(&mut self.0).await
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> S {
        self.0
    }
}

/// Writes `msg` as one framed message and flushes the writer.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &impl Serialize,
    mut progress: impl FnMut(usize, usize),
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(msg).map_err(FrameError::Encode)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge);
    }
    let total = payload.len();
    let mut written = 0;
    for raw in payload.chunks(BLOCK_SIZE) {
        let compressed = compress(raw)?;
        writer.write_all(&header(compressed.len(), raw.len())).await?;
        writer.write_all(&compressed).await?;
        written += raw.len();
        progress(written, total);
    }
    writer.write_all(&header(0, 0)).await?;
    writer.flush().await?;
    trace!(bytes = total, "sent message");
    Ok(())
}

/// Reads blocks until the end-of-message marker and deserializes the payload.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut payload = vec![];
    let mut first = true;
    loop {
        let mut header = [0; HEADER_LEN];
        if let Err(err) = reader.read_exact(&mut header).await {
            return Err(match err.kind() {
                std::io::ErrorKind::UnexpectedEof if first => FrameError::Closed,
                std::io::ErrorKind::UnexpectedEof => FrameError::Truncated,
                _ => FrameError::Io(err),
            });
        }
        first = false;
        let compressed_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let raw_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let (compressed_len, raw_len) = (compressed_len as usize, raw_len as usize);
        if raw_len == 0 {
            if compressed_len != 0 {
                return Err(FrameError::MalformedBlock(format!(
                    "empty block with {compressed_len} compressed bytes"
                )));
            }
            break;
        }
        if raw_len > BLOCK_SIZE {
            return Err(FrameError::MalformedBlock(format!(
                "raw length {raw_len} exceeds block size {BLOCK_SIZE}"
            )));
        }
        if compressed_len == 0 || compressed_len > MAX_COMPRESSED_BLOCK {
            return Err(FrameError::MalformedBlock(format!(
                "invalid compressed length {compressed_len}"
            )));
        }
        if payload.len() + raw_len > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge);
        }
        let mut compressed = vec![0; compressed_len];
        reader.read_exact(&mut compressed).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                FrameError::Truncated
            } else {
                FrameError::Io(err)
            }
        })?;
        decompress_into(&compressed, raw_len, &mut payload)?;
    }
    trace!(bytes = payload.len(), "received message");
    bincode::deserialize(&payload).map_err(FrameError::Decode)
}

fn header(compressed_len: usize, raw_len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    header[..4].copy_from_slice(&(compressed_len as u32).to_be_bytes());
    header[4..].copy_from_slice(&(raw_len as u32).to_be_bytes());
    header
}

fn compress(raw: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

fn decompress_into(compressed: &[u8], raw_len: usize, out: &mut Vec<u8>) -> Result<(), FrameError> {
    let before = out.len();
    // reading one byte more than announced lets us detect blocks that inflate too large
    DeflateDecoder::new(compressed)
        .take(raw_len as u64 + 1)
        .read_to_end(out)
        .map_err(|err| FrameError::MalformedBlock(format!("invalid deflate data: {err}")))?;
    let inflated = out.len() - before;
    if inflated != raw_len {
        return Err(FrameError::MalformedBlock(format!(
            "block inflated to {inflated} bytes but announced {raw_len}"
        )));
    }
    Ok(())
}
