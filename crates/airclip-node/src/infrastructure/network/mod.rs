//! Network infrastructure for the node.
//!
//! # Sub-modules
//!
//! - **`discovery`** – UDP presence protocol.  Broadcasts this node's
//!   `online` record on an interval, listens for everyone else's, and keeps
//!   the live peer set.  Emits `PeerAdded` / `PeerRemoved` events.
//!
//! - **`postman`** – TCP transfer service.  Owns the listener and the
//!   connection pool, dials peers on discovery events, and offers unicast,
//!   broadcast, and one merged inbound stream.
//!
//! - **`guardian`** – One per pooled connection: a reader task, a writer task
//!   and a bounded outbound queue.
//!
//! - **`pool`** – The `PeerKey → Guardian` map and the duplicate-connection
//!   tie-break.
//!
//! - **`wire`** – Async length-prefixed frame I/O and the `Hello` handshake.

pub mod discovery;
pub mod guardian;
pub mod pool;
pub mod postman;
pub mod wire;

use tokio::sync::watch;

/// Resolves once the shutdown flag behind `rx` is set.
///
/// Also resolves if the sender is gone, which only happens when the owning
/// service has been dropped.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
