//! # airclip-core
//!
//! Shared library for AirClip containing the discovery wire envelope, the
//! transfer frame codec, and the peer identity types.
//!
//! This crate is used by the node application and its tests.  It has zero
//! dependencies on sockets, async runtimes, or OS APIs.
//!
//! # Architecture overview
//!
//! AirClip lets machines on the same LAN find each other and exchange short
//! text payloads without a server.  Two protocols are involved:
//!
//! - **Discovery** (UDP broadcast) – every node periodically announces its
//!   [`EndPoint`] inside a [`protocol::envelope`] tagged with
//!   [`ProtocolId::PRESENCE`].  Receivers keep a [`PeerSet`] of live peers.
//!
//! - **Transfer** (TCP) – one persistent connection per peer pair, carrying
//!   length-prefixed [`TransferFrame`]s (see [`protocol::frame`]).
//!
//! This crate defines both byte formats and the pure data structures built on
//! top of them:
//!
//! - **`protocol`** – how bytes travel over the network.
//! - **`domain`** – peer identity and the peer-set state machine.

pub mod domain;
pub mod protocol;

pub use domain::endpoint::{EndPoint, PeerKey};
pub use domain::peer_set::{DiscoveryEvent, DiscoveryEventKind, PeerSet};
pub use protocol::envelope::{
    decode_envelope, encode_envelope, Envelope, EnvelopeError, ProtocolId, ProtocolRegistry,
};
pub use protocol::frame::{decode_frame, encode_frame, FrameError};
pub use protocol::messages::{
    Hello, Message, MessageBody, MessageHeader, PresenceRecord, PresenceStatus, TransferFrame,
};
