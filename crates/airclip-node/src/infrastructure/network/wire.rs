//! Async frame I/O over any byte stream, and the connection handshake.
//!
//! Reads the 4-byte length prefix, validates it, then `read_exact`s the body.
//! Partial reads are handled by `read_exact`; frames never span a length the
//! prefix did not declare.
//!
//! # Handshake
//!
//! Both ends of a new transfer connection write a [`Hello`] first and then
//! read exactly one frame, which must be the peer's `Hello`.  Neither side
//! waits for the other before writing, so the exchange cannot deadlock.

use std::io;
use std::time::Duration;

use airclip_core::protocol::frame::{
    decode_frame_body, encode_frame, frame_body_len, FRAME_PREFIX_SIZE,
};
use airclip_core::{Hello, TransferFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::postman::TransferError;

/// Reads one frame.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.  EOF in the middle
/// of a frame is an `UnexpectedEof` I/O error.
///
/// # Errors
///
/// [`TransferError::Io`] on socket errors, [`TransferError::Frame`] if the
/// prefix is too large or the body does not decode.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<TransferFrame>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = frame_body_len(prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Some(decode_frame_body(&body)?))
}

/// Encodes and writes one frame, then flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &TransferFrame) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Sends `local` and waits for the peer's `Hello`, bounded by `limit`.
///
/// # Errors
///
/// [`TransferError::Handshake`] if the peer closes, sends anything other than
/// a `Hello`, or does not answer in time.  Socket and codec failures are
/// reported as their own variants.
pub async fn exchange_hello<S>(
    stream: &mut S,
    local: &Hello,
    limit: Duration,
) -> Result<Hello, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        write_frame(stream, &TransferFrame::Hello(local.clone())).await?;
        match read_frame(stream).await? {
            Some(TransferFrame::Hello(remote)) => Ok(remote),
            Some(TransferFrame::Message(_)) => Err(TransferError::Handshake(
                "expected hello, got message".to_string(),
            )),
            None => Err(TransferError::Handshake(
                "connection closed before hello".to_string(),
            )),
        }
    };

    timeout(limit, exchange)
        .await
        .map_err(|_| TransferError::Handshake(format!("no hello within {limit:?}")))?
}

// ── Tests ─────────────────────────────────────────────────────────────────────
