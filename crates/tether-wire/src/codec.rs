//! Line codec — frames a byte stream into newline-delimited JSON lines.
//!
//! Splits on `\n` (a trailing `\r` is tolerated and stripped), returning
//! each completed line as a `String`. Lines over [`MAX_FRAME_BYTES`] are a
//! hard protocol violation: the decoder returns [`CodecError::FrameTooLong`]
//! and the connection owner is expected to write one error frame and close.
//! This is deliberately stricter than skip-and-continue — a peer that emits
//! an oversized frame is broken, not noisy.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame length in bytes, terminator excluded.
///
/// A line of exactly this many bytes is accepted; one byte more is fatal
/// to the connection.
pub const MAX_FRAME_BYTES: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Message size exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLong,
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec framing newline-delimited JSON lines with a hard size cap.
#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                // Content length excludes the terminator (and a CR, if any).
                let content_len = if pos > 0 && src[pos - 1] == b'\r' {
                    pos - 1
                } else {
                    pos
                };
                if content_len > MAX_FRAME_BYTES {
                    return Err(CodecError::FrameTooLong);
                }
                let line = src.split_to(pos);
                src.advance(1); // skip \n
                let content = &line[..content_len];
                Ok(Some(std::str::from_utf8(content)?.to_owned()))
            }
            None => {
                // No terminator yet. If more than a full frame has
                // accumulated, the line can no longer fit the cap.
                if src.len() > MAX_FRAME_BYTES {
                    return Err(CodecError::FrameTooLong);
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
