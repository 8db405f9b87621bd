//! The live set of known peers.
//!
//! [`PeerSet`] is the authoritative mapping from [`PeerKey`] to [`EndPoint`].
//! Presence records move a peer between two states:
//!
//! ```text
//!            online                 offline
//!   absent ─────────►  present  ─────────────►  absent
//!                        │  ▲
//!                        └──┘ online (no-op, no event)
//! ```
//!
//! Every real transition yields exactly one [`DiscoveryEvent`]; repeating a
//! status the peer is already in yields nothing.  The type is not
//! synchronised; callers own the locking and must emit events only after
//! releasing their lock.

use std::collections::HashMap;

use tracing::trace;

use crate::domain::endpoint::{EndPoint, PeerKey};
use crate::protocol::messages::{PresenceRecord, PresenceStatus};

/// What happened to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEventKind {
    PeerAdded,
    PeerRemoved,
}

/// A single peer-set transition, emitted by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub kind: DiscoveryEventKind,
    pub endpoint: EndPoint,
}

impl DiscoveryEvent {
    pub fn added(endpoint: EndPoint) -> Self {
        Self {
            kind: DiscoveryEventKind::PeerAdded,
            endpoint,
        }
    }

    pub fn removed(endpoint: EndPoint) -> Self {
        Self {
            kind: DiscoveryEventKind::PeerRemoved,
            endpoint,
        }
    }
}

/// Mapping from peer key to endpoint.
#[derive(Debug, Default, Clone)]
pub struct PeerSet {
    peers: HashMap<PeerKey, EndPoint>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `endpoint` unless its key is already present.
    ///
    /// Returns `true` if the peer was newly inserted.
    pub fn insert(&mut self, endpoint: EndPoint) -> bool {
        let key = endpoint.key().clone();
        if self.peers.contains_key(&key) {
            return false;
        }
        self.peers.insert(key, endpoint);
        true
    }

    /// Removes the peer stored under `key`, returning it if it was present.
    pub fn remove(&mut self, key: &PeerKey) -> Option<EndPoint> {
        self.peers.remove(key)
    }

    /// Applies one presence record and returns the resulting event, if the
    /// record changed anything.
    pub fn apply(&mut self, record: &PresenceRecord) -> Option<DiscoveryEvent> {
        match record.status {
            PresenceStatus::Online => {
                if self.insert(record.from.clone()) {
                    trace!("peer set: added {}", record.from.key());
                    Some(DiscoveryEvent::added(record.from.clone()))
                } else {
                    None
                }
            }
            PresenceStatus::Offline => self.remove(record.from.key()).map(|removed| {
                trace!("peer set: removed {}", removed.key());
                DiscoveryEvent::removed(removed)
            }),
        }
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.peers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns a copy of every known endpoint.  O(n) in peer count.
    pub fn snapshot(&self) -> Vec<EndPoint> {
        self.peers.values().cloned().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
