//! Application layer use cases for the node.
//!
//! Use cases here orchestrate services through traits and contain no socket
//! I/O of their own, so they can be tested against mocks.
//!
//! # Sub-modules
//!
//! - **`peer_sync`** – Feeds discovery events into the transfer layer so a
//!   connection exists for every live peer and disappears when the peer goes
//!   offline.

pub mod peer_sync;
