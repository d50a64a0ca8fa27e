//! IPC codec for length-prefixed framing.
//!
//! Messages are framed as:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: UTF-8 JSON payload
//!
//! The codec only deals in raw frames. JSON decoding happens one layer up so a
//! malformed payload can be answered with an error frame instead of tearing
//! down the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload either side will accept (100 MB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 100_000_000;

const HEADER_LEN: usize = 4;

/// Framing failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared length exceeds the limit; nothing past the header was read
    #[error("Message too large: {declared} > {max}")]
    TooLarge { declared: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    /// Create a new codec with the default max length.
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Create a new codec with a custom max length.
    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Get the max payload length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Checked before any reservation so a hostile prefix cannot force an allocation
        if length > self.max_length {
            return Err(FrameError::TooLarge {
                declared: length,
                max: self.max_length,
            });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let length = item.len();
        if length > self.max_length {
            return Err(FrameError::TooLarge {
                declared: length,
                max: self.max_length,
            });
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_u32(length as u32);
        dst.put_slice(&item);
        Ok(())
    }
}
