//! Length-prefixed framing for transfer connections.
//!
//! Wire format:
//! ```text
//! [len:4][body:len]
//! ```
//! `len` is a big-endian `u32` counting only the body.  The body is a
//! bincode-encoded [`TransferFrame`].
//!
//! TCP is a byte stream, so a single read may deliver half a frame or several
//! frames at once.  [`decode_frame`] therefore reports
//! [`FrameError::InsufficientData`] instead of guessing, and returns how many
//! bytes it consumed so the caller can advance its buffer.

use thiserror::Error;

use crate::protocol::messages::TransferFrame;

/// Size of the length prefix in bytes.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Upper bound on a frame body.  Larger declared lengths are rejected before
/// any allocation happens.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors that can occur while encoding or decoding a transfer frame.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// Not enough bytes have arrived yet; read more and retry.
    #[error("insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The declared body length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("frame decode failed: {0}")]
    Decode(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Serializes `frame` into a length-prefixed byte vector.
///
/// # Errors
///
/// [`FrameError::Encode`] if bincode fails, [`FrameError::TooLarge`] if the
/// body would exceed [`MAX_FRAME_LEN`].
pub fn encode_frame(frame: &TransferFrame) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(frame).map_err(|e| FrameError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(FRAME_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Reads the body length from a 4-byte prefix and checks it against
/// [`MAX_FRAME_LEN`].
pub fn frame_body_len(prefix: [u8; FRAME_PREFIX_SIZE]) -> Result<usize, FrameError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

/// Decodes a frame body (the bytes after the length prefix).
pub fn decode_frame_body(body: &[u8]) -> Result<TransferFrame, FrameError> {
    bincode::deserialize(body).map_err(|e| FrameError::Decode(e.to_string()))
}

/// Decodes one frame from the front of `bytes`.
///
/// Returns the frame and the number of bytes consumed.  Bytes beyond the first
/// frame are left untouched for the next call.
///
/// # Errors
///
/// - [`FrameError::InsufficientData`] if the prefix or body is incomplete.
/// - [`FrameError::TooLarge`] if the declared length exceeds the limit.
/// - [`FrameError::Decode`] if the body is not a valid [`TransferFrame`].
pub fn decode_frame(bytes: &[u8]) -> Result<(TransferFrame, usize), FrameError> {
    if bytes.len() < FRAME_PREFIX_SIZE {
        return Err(FrameError::InsufficientData {
            needed: FRAME_PREFIX_SIZE,
            available: bytes.len(),
        });
    }

    let len = frame_body_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    let total = FRAME_PREFIX_SIZE + len;
    if bytes.len() < total {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let frame = decode_frame_body(&bytes[FRAME_PREFIX_SIZE..total])?;
    Ok((frame, total))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
