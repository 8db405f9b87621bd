//! Protocol module: the discovery envelope, the transfer frame codec, and the
//! payload types carried by both.

pub mod envelope;
pub mod frame;
pub mod messages;

pub use envelope::{decode_envelope, encode_envelope, Envelope, EnvelopeError, ProtocolId, ProtocolRegistry};
pub use frame::{decode_frame, decode_frame_body, encode_frame, frame_body_len, FrameError, MAX_FRAME_LEN};
pub use messages::*;
