//! Connection pool: at most one live Guardian per peer.
//!
//! The Guardian owns the socket, so one map entry holds both the connection
//! and its workers; a key is pooled exactly when its Guardian is.
//!
//! # Duplicate connections
//!
//! Two nodes that discover each other at the same moment may each dial the
//! other, leaving two sockets for one peer pair.  Both ends resolve this the
//! same way without talking to each other: the connection dialled by the node
//! with the smaller node id wins.  Each side knows both ids from the `Hello`
//! exchange, so both pick the same socket.

use std::collections::HashMap;
use std::net::SocketAddr;

use airclip_core::{EndPoint, PeerKey};
use uuid::Uuid;

use super::guardian::Guardian;

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer dialled us.
    Inbound,
    /// We dialled the peer.
    Outbound,
}

/// One pooled connection.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub guardian: Guardian,
    pub remote_addr: SocketAddr,
    pub endpoint: EndPoint,
    pub direction: Direction,
    /// The peer's node id, from its `Hello`.
    pub remote_node_id: Uuid,
}

/// Outcome of offering a new connection to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Nothing pooled under this key.
    Vacant,
    /// The new connection displaces the pooled one.
    Replace,
    /// The pooled connection wins; drop the new one.
    Reject,
}

/// Returns the node id of whichever side dialled a connection.
fn dialer(direction: Direction, local_node_id: Uuid, remote_node_id: Uuid) -> Uuid {
    match direction {
        Direction::Outbound => local_node_id,
        Direction::Inbound => remote_node_id,
    }
}

/// Decides between a pooled connection and a new one for the same peer.
///
/// Connections with different dialers: the smaller dialer id wins.  Same
/// dialer (a reconnect): the newer connection wins.
pub fn prefer_new(
    existing: (Direction, Uuid),
    new: (Direction, Uuid),
    local_node_id: Uuid,
) -> bool {
    let existing_dialer = dialer(existing.0, local_node_id, existing.1);
    let new_dialer = dialer(new.0, local_node_id, new.1);
    if existing_dialer == new_dialer {
        return true;
    }
    new_dialer < existing_dialer
}

/// `PeerKey → PoolEntry`.  Not synchronised; the Postman holds it behind one
/// mutex.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    entries: HashMap<PeerKey, PoolEntry>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides whether a new connection for `key` should be pooled.
    ///
    /// A pooled Guardian that has already closed is always replaced.
    pub fn admission(
        &self,
        key: &PeerKey,
        direction: Direction,
        remote_node_id: Uuid,
        local_node_id: Uuid,
    ) -> Admission {
        let Some(existing) = self.entries.get(key) else {
            return Admission::Vacant;
        };
        if existing.guardian.is_closed() {
            return Admission::Replace;
        }
        if prefer_new(
            (existing.direction, existing.remote_node_id),
            (direction, remote_node_id),
            local_node_id,
        ) {
            Admission::Replace
        } else {
            Admission::Reject
        }
    }

    /// Pools `entry` under `key`, returning whatever it displaced.
    pub fn insert(&mut self, key: PeerKey, entry: PoolEntry) -> Option<PoolEntry> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, key: &PeerKey) -> Option<PoolEntry> {
        self.entries.remove(key)
    }

    /// Removes the entry for `key` only if it still holds Guardian `id`.
    ///
    /// A late exit notice from a replaced Guardian must not evict its
    /// successor.
    pub fn remove_if_current(&mut self, key: &PeerKey, id: u64) -> Option<PoolEntry> {
        match self.entries.get(key) {
            Some(entry) if entry.guardian.id() == id => self.entries.remove(key),
            _ => None,
        }
    }

    pub fn get(&self, key: &PeerKey) -> Option<&PoolEntry> {
        self.entries.get(key)
    }

    /// Returns `true` if `key` is pooled with a Guardian that is still open.
    pub fn has_live(&self, key: &PeerKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.guardian.is_closed())
    }

    pub fn keys(&self) -> Vec<PeerKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&PeerKey, &PoolEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the pool, returning every entry.
    pub fn drain(&mut self) -> Vec<PoolEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::guardian::{GuardianConfig, GuardianExit};
    use tokio::sync::mpsc;

    fn ids() -> (Uuid, Uuid) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn entry(
        key: &PeerKey,
        direction: Direction,
        remote_node_id: Uuid,
        exits: &mpsc::UnboundedSender<GuardianExit>,
    ) -> (PoolEntry, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let (inbound, _rx) = mpsc::channel(4);
        let guardian = Guardian::spawn(
            local,
            key.clone(),
            &GuardianConfig::default(),
            inbound,
            exits.clone(),
        );
        let entry = PoolEntry {
            guardian,
            remote_addr: "127.0.0.1:9457".parse().unwrap(),
            endpoint: EndPoint::new("127.0.0.1".parse().unwrap(), "peer", "pc"),
            direction,
            remote_node_id,
        };
        (entry, remote)
    }

    // ── Tie-break ─────────────────────────────────────────────────────────────

    #[test]
    fn test_both_sides_keep_the_same_connection() {
        // Arrange – `small` and `large` dialled each other
        let (small, large) = ids();

        // Act
        // On `small`: existing inbound (dialled by large), new outbound (by small)
        let small_keeps_new = prefer_new(
            (Direction::Inbound, large),
            (Direction::Outbound, large),
            small,
        );
        // On `large`: existing outbound (dialled by large), new inbound (by small)
        let large_keeps_new = prefer_new(
            (Direction::Outbound, small),
            (Direction::Inbound, small),
            large,
        );

        // Assert – both keep the connection dialled by `small`
        assert!(small_keeps_new);
        assert!(large_keeps_new);
    }

    #[test]
    fn test_losing_direction_is_rejected() {
        let (small, large) = ids();

        // On `small`, an inbound from `large` arrives after our own outbound.
        let keep_new = prefer_new(
            (Direction::Outbound, large),
            (Direction::Inbound, large),
            small,
        );

        assert!(!keep_new);
    }

    #[test]
    fn test_reconnect_from_same_dialer_replaces() {
        let (local, remote) = ids();
        assert!(prefer_new(
            (Direction::Outbound, remote),
            (Direction::Outbound, remote),
            local,
        ));
    }

    // ── Pool operations ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_admission_vacant_then_reject_loser() {
        // Arrange
        let (small, large) = ids();
        let (exits, _exit_rx) = mpsc::unbounded_channel();
        let key = PeerKey::new("peer-pc@127.0.0.1");
        let mut pool = ConnectionPool::new();
        let (outbound, _remote) = entry(&key, Direction::Outbound, large, &exits);

        // Act
        let first = pool.admission(&key, Direction::Outbound, large, small);
        pool.insert(key.clone(), outbound);
        let second = pool.admission(&key, Direction::Inbound, large, small);

        // Assert
        assert_eq!(first, Admission::Vacant);
        assert_eq!(second, Admission::Reject);
    }

    #[tokio::test]
    async fn test_closed_guardian_is_always_replaced() {
        // Arrange
        let (small, large) = ids();
        let (exits, _exit_rx) = mpsc::unbounded_channel();
        let key = PeerKey::new("peer-pc@127.0.0.1");
        let mut pool = ConnectionPool::new();
        let (outbound, _remote) = entry(&key, Direction::Outbound, large, &exits);
        outbound.guardian.stop();
        pool.insert(key.clone(), outbound);

        // Act
        let admission = pool.admission(&key, Direction::Inbound, large, small);

        // Assert
        assert_eq!(admission, Admission::Replace);
        assert!(!pool.has_live(&key));
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_stale_id() {
        // Arrange
        let (exits, _exit_rx) = mpsc::unbounded_channel();
        let key = PeerKey::new("peer-pc@127.0.0.1");
        let mut pool = ConnectionPool::new();
        let (old, _r1) = entry(&key, Direction::Outbound, Uuid::new_v4(), &exits);
        let (new, _r2) = entry(&key, Direction::Outbound, Uuid::new_v4(), &exits);
        let old_id = old.guardian.id();
        let new_id = new.guardian.id();
        pool.insert(key.clone(), old);
        pool.insert(key.clone(), new);

        // Act
        let stale = pool.remove_if_current(&key, old_id);
        let current = pool.remove_if_current(&key, new_id);

        // Assert
        assert!(stale.is_none());
        assert!(current.is_some());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_drain_returns_everything() {
        let (exits, _exit_rx) = mpsc::unbounded_channel();
        let mut pool = ConnectionPool::new();
        let a = PeerKey::new("a-pc@10.0.0.1");
        let b = PeerKey::new("b-pc@10.0.0.2");
        let (ea, _ra) = entry(&a, Direction::Inbound, Uuid::new_v4(), &exits);
        let (eb, _rb) = entry(&b, Direction::Outbound, Uuid::new_v4(), &exits);
        pool.insert(a, ea);
        pool.insert(b, eb);

        let drained = pool.drain();

        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
    }
}
