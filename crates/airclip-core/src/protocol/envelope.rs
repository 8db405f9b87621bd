//! Generic protocol-ID-tagged envelope used on the discovery socket.
//!
//! Wire format:
//! ```text
//! [version:1][reserved:1][protocol_id:2][payload_len:4][payload:N]
//! ```
//! Total header size: 8 bytes.  All multi-byte integers are big-endian.
//!
//! The envelope knows nothing about what the payload means.  A listener holds a
//! [`ProtocolRegistry`] of the protocol ids it is willing to accept and rejects
//! everything else, so the discovery socket can drop stray traffic without the
//! envelope format being tied to presence semantics.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

/// Current envelope version byte.
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Size of the envelope header in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 8;

/// Numeric identifier of the protocol carried in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub u16);

impl ProtocolId {
    /// Presence records (`online` / `offline`) on the discovery socket.
    pub const PRESENCE: ProtocolId = ProtocolId(1);
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Errors that can occur while decoding or admitting an envelope.
#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    /// The bytes do not have the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope is well-formed but its protocol id is not registered on
    /// this listener.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(ProtocolId),
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub protocol_id: ProtocolId,
    pub payload: Vec<u8>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Wraps `payload` in an envelope tagged with `protocol_id`.
///
/// # Examples
///
/// ```rust
/// use airclip_core::protocol::envelope::{decode_envelope, encode_envelope, ProtocolId};
///
/// let bytes = encode_envelope(ProtocolId::PRESENCE, b"{}");
/// let env = decode_envelope(&bytes).unwrap();
/// assert_eq!(env.protocol_id, ProtocolId::PRESENCE);
/// assert_eq!(env.payload, b"{}");
/// ```
pub fn encode_envelope(protocol_id: ProtocolId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    buf.push(ENVELOPE_VERSION);
    buf.push(0x00); // reserved
    buf.extend_from_slice(&protocol_id.0.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decodes exactly one envelope from `bytes`.
///
/// A datagram carries a single envelope, so trailing bytes after the declared
/// payload are treated as malformed rather than ignored.
///
/// # Errors
///
/// Returns [`EnvelopeError::Malformed`] if the header is truncated, the
/// version is unknown, or the declared length disagrees with the data.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
    if bytes.len() < ENVELOPE_HEADER_SIZE {
        return Err(EnvelopeError::Malformed(format!(
            "need at least {ENVELOPE_HEADER_SIZE} bytes, got {}",
            bytes.len()
        )));
    }

    let version = bytes[0];
    if version != ENVELOPE_VERSION {
        return Err(EnvelopeError::Malformed(format!(
            "unsupported envelope version {version}"
        )));
    }

    // bytes[1] is reserved – ignored on decode
    let protocol_id = ProtocolId(u16::from_be_bytes([bytes[2], bytes[3]]));
    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    let available = bytes.len() - ENVELOPE_HEADER_SIZE;
    if available != payload_len {
        return Err(EnvelopeError::Malformed(format!(
            "header declares {payload_len} payload bytes, datagram has {available}"
        )));
    }

    Ok(Envelope {
        protocol_id,
        payload: bytes[ENVELOPE_HEADER_SIZE..].to_vec(),
    })
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// The set of protocol ids a listener accepts.
#[derive(Debug, Default, Clone)]
pub struct ProtocolRegistry {
    supported: HashSet<ProtocolId>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, id: ProtocolId) -> Self {
        self.register(id);
        self
    }

    /// Adds `id` to the accepted set.  Registering twice is harmless.
    pub fn register(&mut self, id: ProtocolId) {
        self.supported.insert(id);
    }

    pub fn contains(&self, id: ProtocolId) -> bool {
        self.supported.contains(&id)
    }

    /// Decodes `bytes` and checks the protocol id against the registry.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::Malformed`] from decoding, or
    /// [`EnvelopeError::UnsupportedProtocol`] when the id is not registered.
    pub fn parse(&self, bytes: &[u8]) -> Result<Envelope, EnvelopeError> {
        let envelope = decode_envelope(bytes)?;
        if !self.contains(envelope.protocol_id) {
            return Err(EnvelopeError::UnsupportedProtocol(envelope.protocol_id));
        }
        Ok(envelope)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
