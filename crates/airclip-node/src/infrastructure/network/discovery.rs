//! UDP broadcast presence protocol.
//!
//! Every node binds a UDP socket on the discovery port (default 9456) and:
//!
//! 1. Broadcasts its own `online` [`PresenceRecord`] shortly after start and
//!    then once per interval (default 60 s).
//! 2. Receives everyone else's records, overwrites the advertised address with
//!    the datagram's source address, drops its own echoes, and applies the
//!    record to the [`PeerSet`].  Records carry a per-process node id, which
//!    is how echoes are recognised even when interface enumeration misses an
//!    address.
//! 3. Emits a [`DiscoveryEvent`] for every real transition.
//! 4. When a peer appears for the first time, unicasts its own `online`
//!    record straight back so the newcomer does not wait a full interval.
//! 5. On shutdown, broadcasts `offline` once (best effort).
//!
//! The transfer layer can [`forget`](DiscoveryService::forget) a peer whose
//! connection failed; the peer's next `online` record then counts as new,
//! emits `PeerAdded` again and gets a unicast reply.
//!
//! Records travel as JSON inside an envelope tagged
//! [`ProtocolId::PRESENCE`]; envelopes with any other protocol id are dropped.
//!
//! # Locking
//!
//! The peer set sits behind one `std::sync::Mutex`.  A datagram is parsed and
//! self-filtered before the lock is taken, and the event is sent only after
//! the lock is released.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use airclip_core::{
    encode_envelope, DiscoveryEvent, DiscoveryEventKind, EndPoint, EnvelopeError, PeerKey,
    PeerSet, PresenceRecord, PresenceStatus, ProtocolId, ProtocolRegistry,
};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::stopped;
use crate::application::peer_sync::PresenceTracker;

/// Receive buffer size; larger datagrams are truncated and fail to parse.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Pause after the first failed `recv_from`; doubles per consecutive failure.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RECV_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Error type for discovery service operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be bound or configured.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("malformed presence record: {0}")]
    MalformedPresence(#[source] serde_json::Error),

    #[error("failed to encode presence record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to send presence to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery service not started")]
    NotStarted,

    #[error("discovery service already started")]
    AlreadyStarted,
}

/// Runtime settings for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub bind_address: IpAddr,
    pub broadcast_address: IpAddr,
    /// Destination port for broadcasts; `None` means `port`.
    pub broadcast_port: Option<u16>,
    pub interval: Duration,
    pub warmup: Duration,
    pub event_buffer: usize,
    /// Upper bound on the `offline` announcement at shutdown.
    pub offline_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 9456,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_port: None,
            interval: Duration::from_secs(60),
            warmup: Duration::from_millis(500),
            event_buffer: 64,
            offline_timeout: Duration::from_secs(1),
        }
    }
}

impl DiscoveryConfig {
    fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_address, self.broadcast_port.unwrap_or(self.port))
    }
}

struct Inner {
    config: DiscoveryConfig,
    self_info: EndPoint,
    node_id: Uuid,
    registry: ProtocolRegistry,
    local_addrs: Vec<IpAddr>,
    peers: Mutex<PeerSet>,
    socket: OnceLock<Arc<UdpSocket>>,
    events_tx: mpsc::Sender<DiscoveryEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<DiscoveryEvent>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

/// The presence service.  Cheap to clone; clones share one peer set.
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl DiscoveryService {
    /// Creates a stopped service, detecting local interface addresses for the
    /// self filter.
    pub fn new(config: DiscoveryConfig, self_info: EndPoint) -> Self {
        Self::with_local_addrs(config, self_info, detect_local_addrs())
    }

    /// Creates a stopped service with an explicit local address list.
    pub fn with_local_addrs(
        config: DiscoveryConfig,
        self_info: EndPoint,
        local_addrs: Vec<IpAddr>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (shutdown, _) = watch::channel(false);
        debug!("discovery self filter addresses: {local_addrs:?}");

        Self {
            inner: Arc::new(Inner {
                config,
                self_info,
                node_id: Uuid::new_v4(),
                registry: ProtocolRegistry::new().with(ProtocolId::PRESENCE),
                local_addrs,
                peers: Mutex::new(PeerSet::new()),
                socket: OnceLock::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                shutdown,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Binds the socket and spawns the receive loop and the broadcast ticker.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::BindFailed`] if the socket cannot be bound or put in
    /// broadcast mode, [`DiscoveryError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> Result<SocketAddr, DiscoveryError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyStarted);
        }

        let addr = SocketAddr::new(self.inner.config.bind_address, self.inner.config.port);
        let bound = async {
            let socket = UdpSocket::bind(addr).await?;
            socket.set_broadcast(true)?;
            let local = socket.local_addr()?;
            Ok::<_, std::io::Error>((socket, local))
        }
        .await;
        let (socket, local) = match bound {
            Ok(pair) => pair,
            Err(source) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(DiscoveryError::BindFailed { addr, source });
            }
        };

        let socket = Arc::new(socket);
        let _ = self.inner.socket.set(Arc::clone(&socket));

        tokio::spawn(recv_loop(Arc::clone(&self.inner), socket));
        tokio::spawn(tick_loop(Arc::clone(&self.inner)));

        info!(
            "discovery listening on UDP {local} as {}",
            self.inner.self_info.label()
        );
        Ok(local)
    }

    /// Processes one datagram as if it had arrived from `src`.
    ///
    /// Returns the event emitted, if the datagram changed the peer set.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Envelope`] for malformed or foreign envelopes,
    /// [`DiscoveryError::MalformedPresence`] for a bad JSON payload.  The peer
    /// set is untouched on error.
    pub async fn handle_datagram(
        &self,
        bytes: &[u8],
        src: SocketAddr,
    ) -> Result<Option<DiscoveryEvent>, DiscoveryError> {
        self.inner.handle_datagram(bytes, src).await
    }

    /// Broadcasts this node's `online` record.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::NotStarted`] before [`start`](Self::start);
    /// [`DiscoveryError::Send`] if the socket rejects the datagram.
    pub async fn broadcast_self(&self) -> Result<(), DiscoveryError> {
        let target = self.inner.config.broadcast_target();
        self.inner.send_presence(PresenceStatus::Online, target).await
    }

    /// Broadcasts this node's `offline` record once, bounded by the configured
    /// timeout.  Failures are logged.
    pub async fn announce_offline(&self) {
        let target = self.inner.config.broadcast_target();
        let sent = timeout(
            self.inner.config.offline_timeout,
            self.inner.send_presence(PresenceStatus::Offline, target),
        )
        .await;

        match sent {
            Ok(Ok(())) => info!("announced offline to {target}"),
            Ok(Err(e)) => warn!("offline announcement failed: {e}"),
            Err(_) => warn!("offline announcement to {target} timed out"),
        }
    }

    /// Snapshot of the current peer set.
    pub fn peers(&self) -> Vec<EndPoint> {
        self.inner.peers().snapshot()
    }

    pub fn self_info(&self) -> &EndPoint {
        &self.inner.self_info
    }

    /// The id stamped on every record this service sends.
    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    /// Drops `key` from the peer set without emitting an event.
    ///
    /// Used when the transfer layer has lost the peer.  If the peer is still
    /// around, its next `online` record re-adds it.  Returns `false` if the
    /// key was not known.
    pub fn forget(&self, key: &PeerKey) -> bool {
        let removed = self.inner.peers().remove(key);
        match removed {
            Some(endpoint) => {
                info!("forgetting unreachable peer {endpoint}");
                true
            }
            None => false,
        }
    }

    /// Takes the event receiver.  Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.inner
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Signals the receive loop and ticker to exit.  Idempotent; does not wait.
    pub fn stop(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!("discovery stopping");
        }
    }
}

impl PresenceTracker for DiscoveryService {
    fn forget_peer(&self, key: &PeerKey) -> bool {
        self.forget(key)
    }
}

impl Inner {
    fn peers(&self) -> MutexGuard<'_, PeerSet> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Own echoes: the record carries our node id, the source is one of our
    /// interface addresses, or a loopback packet carries our display
    /// identity.
    fn is_self(&self, record: &PresenceRecord) -> bool {
        if record.node_id == Some(self.node_id) {
            return true;
        }
        let ip = record.from.address();
        self.local_addrs.contains(&ip)
            || (ip.is_loopback() && record.from.same_display_identity(&self.self_info))
    }

    async fn handle_datagram(
        &self,
        bytes: &[u8],
        src: SocketAddr,
    ) -> Result<Option<DiscoveryEvent>, DiscoveryError> {
        let envelope = self.registry.parse(bytes)?;
        let mut record =
            PresenceRecord::from_json(&envelope.payload).map_err(DiscoveryError::MalformedPresence)?;
        record.from = record.from.with_address(src.ip());

        if self.is_self(&record) {
            trace!("ignoring own presence echo from {src}");
            return Ok(None);
        }

        let event = self.peers().apply(&record);
        let Some(event) = event else {
            trace!("presence from {} changed nothing", record.from.key());
            return Ok(None);
        };

        match event.kind {
            DiscoveryEventKind::PeerAdded => info!("peer online: {}", event.endpoint),
            DiscoveryEventKind::PeerRemoved => info!("peer offline: {}", event.endpoint),
        }

        let mut stop_rx = self.shutdown.subscribe();
        tokio::select! {
            _ = stopped(&mut stop_rx) => return Ok(Some(event)),
            sent = self.events_tx.send(event.clone()) => {
                if sent.is_err() {
                    debug!("discovery event receiver dropped");
                }
            }
        }

        if event.kind == DiscoveryEventKind::PeerAdded && self.socket.get().is_some() {
            if let Err(e) = self.send_presence(PresenceStatus::Online, src).await {
                warn!("presence reply to {src} failed: {e}");
            }
        }

        Ok(Some(event))
    }

    async fn send_presence(
        &self,
        status: PresenceStatus,
        target: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let socket = self.socket.get().ok_or(DiscoveryError::NotStarted)?;
        let datagram = self.presence_datagram(status)?;

        socket
            .send_to(&datagram, target)
            .await
            .map_err(|source| DiscoveryError::Send {
                addr: target,
                source,
            })?;
        trace!("sent {status:?} presence to {target}");
        Ok(())
    }

    fn presence_datagram(&self, status: PresenceStatus) -> Result<Vec<u8>, DiscoveryError> {
        let record = PresenceRecord {
            from: self.self_info.clone(),
            status,
            node_id: Some(self.node_id),
        };
        let payload = record.to_json().map_err(DiscoveryError::Encode)?;
        Ok(encode_envelope(ProtocolId::PRESENCE, &payload))
    }
}

/// Pause before the next `recv_from` after `failures` consecutive errors.
fn recv_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    RECV_ERROR_BACKOFF
        .saturating_mul(1 << shift)
        .min(MAX_RECV_ERROR_BACKOFF)
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn recv_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut stop_rx = inner.shutdown.subscribe();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut failures = 0u32;

    loop {
        let received = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, src) = match received {
            Ok(pair) => pair,
            Err(e) => {
                // Some platforms surface ICMP port-unreachable here.
                failures = failures.saturating_add(1);
                let pause = recv_backoff(failures);
                if failures == 1 {
                    debug!("discovery recv error: {e}");
                } else {
                    warn!("discovery recv error ({failures} in a row), retrying in {pause:?}: {e}");
                }
                tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    _ = tokio::time::sleep(pause) => {}
                }
                continue;
            }
        };
        failures = 0;

        if let Err(e) = inner.handle_datagram(&buf[..len], src).await {
            debug!("dropping datagram from {src}: {e}");
        }
    }

    info!("discovery receive loop stopped");
}

async fn tick_loop(inner: Arc<Inner>) {
    let mut stop_rx = inner.shutdown.subscribe();

    tokio::select! {
        _ = stopped(&mut stop_rx) => return,
        _ = tokio::time::sleep(inner.config.warmup) => {}
    }

    let target = inner.config.broadcast_target();
    let mut ticker = tokio::time::interval(inner.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = inner.send_presence(PresenceStatus::Online, target).await {
            warn!("presence broadcast failed: {e}");
        }
    }

    debug!("discovery ticker stopped");
}

/// Non-loopback IPv4 addresses of every local interface.
fn detect_local_addrs() -> Vec<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces
            .into_iter()
            .map(|(_, ip)| ip)
            .filter(|ip| ip.is_ipv4() && !ip.is_loopback())
            .collect(),
        Err(e) => {
            warn!("could not enumerate local interfaces: {e}");
            Vec::new()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn self_info() -> EndPoint {
        EndPoint::local("me", "laptop")
    }

    fn service(local_addrs: Vec<IpAddr>) -> DiscoveryService {
        DiscoveryService::with_local_addrs(DiscoveryConfig::default(), self_info(), local_addrs)
    }

    fn datagram(from: EndPoint, status: PresenceStatus) -> Vec<u8> {
        let record = PresenceRecord {
            from,
            status,
            node_id: None,
        };
        encode_envelope(ProtocolId::PRESENCE, &record.to_json().unwrap())
    }

    fn src(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 9456)
    }

    #[tokio::test]
    async fn test_online_from_new_peer_emits_added_with_observed_address() {
        // Arrange – the payload claims a different address than the socket saw
        let svc = service(vec![]);
        let mut events = svc.take_events().unwrap();
        let claimed = EndPoint::new("1.2.3.4".parse().unwrap(), "bob", "pc");

        // Act
        let event = svc
            .handle_datagram(&datagram(claimed, PresenceStatus::Online), src("192.168.1.7"))
            .await
            .unwrap()
            .expect("new peer");

        // Assert
        assert_eq!(event.kind, DiscoveryEventKind::PeerAdded);
        assert_eq!(event.endpoint.address(), "192.168.1.7".parse::<IpAddr>().unwrap());
        assert_eq!(events.recv().await.unwrap(), event);
        assert_eq!(svc.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_online_emits_once() {
        let svc = service(vec![]);
        let bob = EndPoint::local("bob", "pc");

        let first = svc
            .handle_datagram(&datagram(bob.clone(), PresenceStatus::Online), src("10.0.0.2"))
            .await
            .unwrap();
        let second = svc
            .handle_datagram(&datagram(bob, PresenceStatus::Online), src("10.0.0.2"))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_offline_removes_known_peer() {
        // Arrange
        let svc = service(vec![]);
        let bob = EndPoint::local("bob", "pc");
        svc.handle_datagram(&datagram(bob.clone(), PresenceStatus::Online), src("10.0.0.2"))
            .await
            .unwrap();

        // Act
        let event = svc
            .handle_datagram(&datagram(bob, PresenceStatus::Offline), src("10.0.0.2"))
            .await
            .unwrap();

        // Assert
        assert_eq!(event.map(|e| e.kind), Some(DiscoveryEventKind::PeerRemoved));
        assert!(svc.peers().is_empty());
    }

    #[tokio::test]
    async fn test_echo_from_local_address_is_ignored() {
        let svc = service(vec!["192.168.1.20".parse().unwrap()]);
        let mut events = svc.take_events().unwrap();

        let event = svc
            .handle_datagram(
                &datagram(EndPoint::local("other-name", "x"), PresenceStatus::Online),
                src("192.168.1.20"),
            )
            .await
            .unwrap();

        assert!(event.is_none());
        assert!(svc.peers().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loopback_echo_with_own_identity_is_ignored() {
        let svc = service(vec![]);

        let event = svc
            .handle_datagram(&datagram(self_info(), PresenceStatus::Online), src("127.0.0.1"))
            .await
            .unwrap();

        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored_even_without_local_addrs() {
        // Arrange – interface enumeration found nothing
        let svc = service(vec![]);
        let mut events = svc.take_events().unwrap();
        let own = svc.inner.presence_datagram(PresenceStatus::Online).unwrap();

        // Act – our broadcast comes back from a LAN address
        let event = svc.handle_datagram(&own, src("192.168.1.20")).await.unwrap();

        // Assert
        assert!(event.is_none());
        assert!(svc.peers().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_identity_from_another_process_is_a_peer() {
        let svc = service(vec![]);
        let bytes = encode_envelope(
            ProtocolId::PRESENCE,
            &PresenceRecord::online(self_info())
                .with_node_id(Uuid::new_v4())
                .to_json()
                .unwrap(),
        );

        let event = svc.handle_datagram(&bytes, src("192.168.1.30")).await.unwrap();

        assert_eq!(event.map(|e| e.kind), Some(DiscoveryEventKind::PeerAdded));
    }

    #[tokio::test]
    async fn test_forgotten_peer_is_added_again_on_next_online() {
        // Arrange
        let svc = service(vec![]);
        let mut events = svc.take_events().unwrap();
        let bob = EndPoint::local("bob", "pc");
        let online = datagram(bob.clone(), PresenceStatus::Online);
        svc.handle_datagram(&online, src("10.0.0.2")).await.unwrap();
        let key = bob.with_address("10.0.0.2".parse().unwrap()).key().clone();
        assert_eq!(events.recv().await.unwrap().kind, DiscoveryEventKind::PeerAdded);

        // Act
        let forgotten = svc.forget_peer(&key);
        let again = svc.handle_datagram(&online, src("10.0.0.2")).await.unwrap();

        // Assert – forgetting is silent, the re-announcement is not
        assert!(forgotten);
        assert_eq!(again.map(|e| e.kind), Some(DiscoveryEventKind::PeerAdded));
        assert_eq!(events.recv().await.unwrap().kind, DiscoveryEventKind::PeerAdded);
        assert!(events.try_recv().is_err());
        assert!(!svc.forget(&PeerKey::new("ghost-pc@10.9.9.9")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_snapshots_are_isolated_from_concurrent_updates() {
        // Arrange
        let svc = service(vec![]);
        let mut events = svc.take_events().unwrap();
        tokio::spawn(async move { while events.recv().await.is_some() {} });

        // Act – one task keeps adding peers while this one keeps snapshotting
        let writer = tokio::spawn({
            let svc = svc.clone();
            async move {
                for i in 0..200 {
                    let peer = EndPoint::local(format!("peer{i}"), "pc");
                    svc.handle_datagram(&datagram(peer, PresenceStatus::Online), src("10.0.0.2"))
                        .await
                        .unwrap();
                }
            }
        });

        let mut taken = Vec::new();
        while !writer.is_finished() {
            let snapshot = svc.peers();
            taken.push((snapshot.len(), snapshot));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        // Assert – no snapshot changed after it was taken, none saw a
        // duplicate, and they only ever grew
        let mut previous = 0;
        for (len_when_taken, snapshot) in &taken {
            assert_eq!(snapshot.len(), *len_when_taken);
            let keys: std::collections::HashSet<_> = snapshot.iter().map(|p| p.key()).collect();
            assert_eq!(keys.len(), snapshot.len());
            assert!(snapshot.len() >= previous);
            previous = snapshot.len();
        }
        assert_eq!(svc.peers().len(), 200);
    }

    #[test]
    fn test_recv_backoff_doubles_up_to_cap() {
        assert_eq!(recv_backoff(1), RECV_ERROR_BACKOFF);
        assert_eq!(recv_backoff(2), RECV_ERROR_BACKOFF * 2);
        assert_eq!(recv_backoff(3), RECV_ERROR_BACKOFF * 4);
        assert_eq!(recv_backoff(50), MAX_RECV_ERROR_BACKOFF);
        assert_eq!(recv_backoff(u32::MAX), MAX_RECV_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_foreign_protocol_is_rejected() {
        // Arrange
        let svc = service(vec![]);
        let bytes = encode_envelope(ProtocolId(7), b"{}");

        // Act
        let result = svc.handle_datagram(&bytes, src("10.0.0.2")).await;

        // Assert
        assert!(matches!(
            result,
            Err(DiscoveryError::Envelope(EnvelopeError::UnsupportedProtocol(_)))
        ));
        assert!(svc.peers().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_datagram_is_malformed() {
        let svc = service(vec![]);
        let mut bytes = datagram(EndPoint::local("bob", "pc"), PresenceStatus::Online);
        bytes.truncate(bytes.len() - 2);

        let result = svc.handle_datagram(&bytes, src("10.0.0.2")).await;

        assert!(matches!(
            result,
            Err(DiscoveryError::Envelope(EnvelopeError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn test_bad_json_is_malformed_presence() {
        let svc = service(vec![]);
        let bytes = encode_envelope(ProtocolId::PRESENCE, b"{not json");

        let result = svc.handle_datagram(&bytes, src("10.0.0.2")).await;

        assert!(matches!(result, Err(DiscoveryError::MalformedPresence(_))));
    }

    #[tokio::test]
    async fn test_same_name_at_two_addresses_are_two_peers() {
        let svc = service(vec![]);
        let bob = EndPoint::local("bob", "pc");

        for ip in ["10.0.0.2", "10.0.0.3"] {
            svc.handle_datagram(&datagram(bob.clone(), PresenceStatus::Online), src(ip))
                .await
                .unwrap();
        }

        assert_eq!(svc.peers().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_before_start_is_not_started() {
        let svc = service(vec![]);
        assert!(matches!(
            svc.broadcast_self().await,
            Err(DiscoveryError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        // Arrange
        let config = DiscoveryConfig {
            port: 0,
            bind_address: "127.0.0.1".parse().unwrap(),
            ..DiscoveryConfig::default()
        };
        let svc = DiscoveryService::with_local_addrs(config, self_info(), vec![]);

        // Act
        svc.start().await.unwrap();
        let second = svc.start().await;
        svc.stop();
        svc.stop();

        // Assert
        assert!(matches!(second, Err(DiscoveryError::AlreadyStarted)));
    }

    #[test]
    fn test_broadcast_target_defaults_to_discovery_port() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.broadcast_target(), "255.255.255.255:9456".parse().unwrap());
    }

    #[test]
    fn test_detected_local_addrs_exclude_loopback() {
        assert!(detect_local_addrs().iter().all(|ip| !ip.is_loopback()));
    }
}
