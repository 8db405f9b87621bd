//! Domain entities for AirClip.
//!
//! This module contains pure peer-tracking logic with no infrastructure
//! dependencies: no sockets, no async, no locks.  The discovery service in
//! `airclip-node` wraps these types in its own synchronisation and I/O.
//!
//! - [`endpoint`] – who a node is ([`EndPoint`](endpoint::EndPoint)) and the
//!   key it is tracked under ([`PeerKey`](endpoint::PeerKey)).
//! - [`peer_set`] – the live set of known peers and the online/offline
//!   transitions that produce discovery events.

pub mod endpoint;
pub mod peer_set;
