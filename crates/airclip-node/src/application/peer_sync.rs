//! Discovery ↔ transfer pumps.
//!
//! Discovery decides *who* is on the network; the transfer layer decides how
//! to reach them.  This module connects the two without either knowing about
//! the other:
//!
//! - [`spawn_peer_sync`] reads discovery events in order and hands them to a
//!   [`PeerLinkHandler`], one at a time.
//! - [`spawn_failure_feedback`] goes the other way: every peer whose link
//!   failed is handed to a [`PresenceTracker`] to forget, so the peer's next
//!   `online` broadcast counts as new and triggers a fresh dial.

use std::sync::Arc;

use airclip_core::{DiscoveryEvent, PeerKey};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Something that maintains links to peers in response to discovery events.
///
/// The transfer service implements this; tests use a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerLinkHandler: Send + Sync {
    /// Handles one event.  Errors are the handler's to log; the pump keeps
    /// going regardless.
    async fn on_discovery_event(&self, event: DiscoveryEvent);
}

/// Something that tracks which peers are present.
///
/// The discovery service implements this.
#[cfg_attr(test, mockall::automock)]
pub trait PresenceTracker: Send + Sync {
    /// Drops `key` from the live set without emitting an event.  Returns
    /// `false` if it was not there.
    fn forget_peer(&self, key: &PeerKey) -> bool;
}

/// Forwards every event from `events` to `handler` until the channel closes.
///
/// Events are handled sequentially, so a `PeerRemoved` is never processed
/// before the `PeerAdded` that preceded it.
pub fn spawn_peer_sync<H>(mut events: mpsc::Receiver<DiscoveryEvent>, handler: Arc<H>) -> JoinHandle<()>
where
    H: PeerLinkHandler + ?Sized + 'static,
{
    tokio::spawn(async move {
        let mut handled = 0u64;
        while let Some(event) = events.recv().await {
            debug!("peer sync: {:?} {}", event.kind, event.endpoint);
            handler.on_discovery_event(event).await;
            handled += 1;
        }
        info!("peer sync finished after {handled} event(s)");
    })
}

/// Hands every failed peer from `failures` to `tracker` until the channel
/// closes.
pub fn spawn_failure_feedback<T>(
    mut failures: mpsc::Receiver<PeerKey>,
    tracker: Arc<T>,
) -> JoinHandle<()>
where
    T: PresenceTracker + ?Sized + 'static,
{
    tokio::spawn(async move {
        while let Some(key) = failures.recv().await {
            if tracker.forget_peer(&key) {
                debug!("link to {key} failed, peer forgotten until it announces again");
            }
        }
        debug!("failure feedback finished");
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use airclip_core::{DiscoveryEventKind, EndPoint};
    use mockall::Sequence;

    fn peer(name: &str) -> EndPoint {
        EndPoint::new("10.0.0.9".parse().unwrap(), name, "pc")
    }

    #[tokio::test]
    async fn test_events_are_forwarded_in_order() {
        // Arrange
        let mut mock = MockPeerLinkHandler::new();
        let mut seq = Sequence::new();
        mock.expect_on_discovery_event()
            .withf(|e| e.kind == DiscoveryEventKind::PeerAdded && e.endpoint.name() == "bob")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        mock.expect_on_discovery_event()
            .withf(|e| e.kind == DiscoveryEventKind::PeerRemoved && e.endpoint.name() == "bob")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let (tx, rx) = mpsc::channel(8);

        // Act
        let task = spawn_peer_sync(rx, Arc::new(mock));
        tx.send(DiscoveryEvent::added(peer("bob"))).await.unwrap();
        tx.send(DiscoveryEvent::removed(peer("bob"))).await.unwrap();
        drop(tx);

        // Assert – the task ends when the channel closes; mock expectations
        // are verified when the handler is dropped with the task
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_ends_pump_without_calls() {
        let mut mock = MockPeerLinkHandler::new();
        mock.expect_on_discovery_event().times(0);
        let (tx, rx) = mpsc::channel::<DiscoveryEvent>(1);
        drop(tx);

        spawn_peer_sync(rx, Arc::new(mock)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_links_are_forgotten() {
        // Arrange
        let mut mock = MockPresenceTracker::new();
        let mut seq = Sequence::new();
        for name in ["bob-pc@10.0.0.9", "eve-pc@10.0.0.9"] {
            mock.expect_forget_peer()
                .withf(move |key| key.as_str() == name)
                .times(1)
                .in_sequence(&mut seq)
                .return_const(true);
        }
        let (tx, rx) = mpsc::channel(8);

        // Act
        let task = spawn_failure_feedback(rx, Arc::new(mock));
        tx.send(peer("bob").key().clone()).await.unwrap();
        tx.send(peer("eve").key().clone()).await.unwrap();
        drop(tx);

        // Assert
        task.await.unwrap();
    }
}
