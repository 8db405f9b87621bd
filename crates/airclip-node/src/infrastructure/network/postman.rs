//! Postman: the TCP transfer service.
//!
//! Keeps one durable connection per discovered peer and exposes three ways to
//! use them:
//!
//! - [`Postman::send_to`] – unicast to one pooled peer.
//! - [`Postman::broadcast`] – one message to every pooled peer.
//! - [`Postman::take_inbound`] – a single receiver merging every peer's
//!   inbound messages.
//!
//! # Connection lifecycle
//!
//! ```text
//! PeerAdded ──► dial ──► Hello exchange ──► admit ──► pooled Guardian
//! accept    ──────────► Hello exchange ──► admit ──┘        │
//!                                                           │ EOF / error / stop
//! PeerRemoved ──► evict + stop ◄──── reaper ◄── GuardianExit┘
//!                                        │
//!                       link failure ◄───┘ (also on dial failure)
//! ```
//!
//! A failed dial, or a pooled connection that dies on its own, is reported on
//! the [`take_link_failures`](Postman::take_link_failures) channel so
//! discovery can forget the peer and re-announce it on its next broadcast.
//!
//! The pool lives behind one `std::sync::Mutex` that is never held across an
//! `.await`.  `send_to` and `broadcast` are synchronous: they only `try_send`
//! onto bounded queues.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use airclip_core::{
    DiscoveryEvent, DiscoveryEventKind, EndPoint, FrameError, Hello, Message, PeerKey,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::guardian::{Guardian, GuardianConfig, GuardianExit};
use super::pool::{Admission, ConnectionPool, Direction, PoolEntry};
use super::stopped;
use super::wire::exchange_hello;
use crate::application::peer_sync::PeerLinkHandler;

/// Error type for transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The TCP listener could not be bound.
    #[error("failed to bind transfer listener on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    DialFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr}")]
    DialTimeout { addr: SocketAddr },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no connection to peer {0}")]
    UnknownPeer(PeerKey),

    #[error("connection to {0} is closed")]
    GuardianClosed(PeerKey),

    #[error("outbound queue for {0} is full")]
    QueueFull(PeerKey),

    #[error("transfer service already started")]
    AlreadyStarted,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capacity of the link-failure channel; reports beyond it are dropped.
const LINK_FAILURE_BUFFER: usize = 64;

/// Runtime settings for the transfer service.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Listener port, and the port dialled for peers that advertise none.
    pub port: u16,
    pub bind_address: IpAddr,
    /// Capacity of the merged inbound channel.
    pub inbound_queue: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub guardian: GuardianConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: 9457,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            inbound_queue: 1024,
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            guardian: GuardianConfig::default(),
        }
    }
}

struct Inner {
    config: TransferConfig,
    self_info: EndPoint,
    node_id: Uuid,
    pool: Mutex<ConnectionPool>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    exit_tx: mpsc::UnboundedSender<GuardianExit>,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<GuardianExit>>>,
    failures_tx: mpsc::Sender<PeerKey>,
    failures_rx: Mutex<Option<mpsc::Receiver<PeerKey>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
}

/// The transfer service.  Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct Postman {
    inner: Arc<Inner>,
}

impl Postman {
    /// Creates a stopped service for the local node `self_info`.
    pub fn new(config: TransferConfig, self_info: EndPoint) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::channel(LINK_FAILURE_BUFFER);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                self_info,
                node_id: Uuid::new_v4(),
                pool: Mutex::new(ConnectionPool::new()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                exit_tx,
                exit_rx: Mutex::new(Some(exit_rx)),
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
                shutdown,
                started: AtomicBool::new(false),
                local_addr: OnceLock::new(),
            }),
        }
    }

    /// Binds the listener and spawns the accept loop and the reaper.
    ///
    /// Returns the bound address; with port `0` the OS picks one.
    ///
    /// # Errors
    ///
    /// [`TransferError::BindFailed`] if the listener cannot be bound,
    /// [`TransferError::AlreadyStarted`] on a second call.
    pub async fn start(&self) -> Result<SocketAddr, TransferError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TransferError::AlreadyStarted);
        }

        let addr = SocketAddr::new(self.inner.config.bind_address, self.inner.config.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(TransferError::BindFailed { addr, source });
            }
        };
        let local = listener
            .local_addr()
            .map_err(|source| TransferError::BindFailed { addr, source })?;
        let _ = self.inner.local_addr.set(local);

        let exits = self
            .inner
            .exit_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(exits) = exits {
            tokio::spawn(reap_loop(Arc::clone(&self.inner), exits));
        }
        tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));

        info!(
            "transfer service listening on TCP {local} as {} (node {})",
            self.inner.self_info.label(),
            self.inner.node_id
        );
        Ok(local)
    }

    /// Reacts to one discovery event: dial on `PeerAdded`, evict on
    /// `PeerRemoved`.  Failures are logged and reported as link failures,
    /// not returned.
    pub async fn handle_discovery_event(&self, event: &DiscoveryEvent) {
        match event.kind {
            DiscoveryEventKind::PeerAdded => {
                let key = event.endpoint.key();
                if let Err(e) = self.connect(&event.endpoint).await {
                    warn!("could not connect to {key}: {e}");
                    // The peer may have dialled us in the meantime.
                    if !self.inner.pool().has_live(key) {
                        self.inner.report_failure(key);
                    }
                }
            }
            DiscoveryEventKind::PeerRemoved => {
                self.disconnect(event.endpoint.key());
            }
        }
    }

    /// Ensures a pooled connection to `endpoint`, dialling if necessary.
    ///
    /// Returns the key the connection is pooled under.  If the peer's own
    /// connection wins the tie-break during the dial, that one is kept.
    ///
    /// # Errors
    ///
    /// [`TransferError::DialFailure`], [`TransferError::DialTimeout`] or
    /// [`TransferError::Handshake`].  There is no retry.
    pub async fn connect(&self, endpoint: &EndPoint) -> Result<PeerKey, TransferError> {
        let key = endpoint.key().clone();
        if self.inner.pool().has_live(&key) {
            debug!("already connected to {key}");
            return Ok(key);
        }

        let port = match endpoint.transfer_port() {
            0 => self.inner.config.port,
            p => p,
        };
        let addr = SocketAddr::new(endpoint.address(), port);

        let mut stream = match timeout(self.inner.config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Err(_) => return Err(TransferError::DialTimeout { addr }),
            Ok(Err(source)) => return Err(TransferError::DialFailure { addr, source }),
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        let hello = exchange_hello(
            &mut stream,
            &self.local_hello(),
            self.inner.config.handshake_timeout,
        )
        .await?;
        if !hello.endpoint.same_display_identity(endpoint) {
            warn!(
                "{addr} introduced itself as {}, expected {}",
                hello.endpoint.label(),
                endpoint.label()
            );
        }

        self.inner
            .admit(stream, addr, endpoint.clone(), Direction::Outbound, hello.node_id);
        Ok(key)
    }

    /// Evicts and stops the connection for `key`.  Returns `false` if none
    /// was pooled.
    pub fn disconnect(&self, key: &PeerKey) -> bool {
        let removed = self.inner.pool().remove(key);
        match removed {
            Some(entry) => {
                entry.guardian.stop();
                info!("disconnected from {key}");
                true
            }
            None => false,
        }
    }

    /// Queues `message` for one peer, stamping the header if absent.
    ///
    /// # Errors
    ///
    /// [`TransferError::UnknownPeer`] if `key` is not pooled (nothing is
    /// sent), otherwise whatever the Guardian reports
    /// ([`TransferError::QueueFull`], [`TransferError::GuardianClosed`]).
    pub fn send_to(&self, key: &PeerKey, mut message: Message) -> Result<(), TransferError> {
        let guardian = self
            .inner
            .pool()
            .get(key)
            .map(|entry| entry.guardian.clone())
            .ok_or_else(|| TransferError::UnknownPeer(key.clone()))?;

        message.stamp_if_absent(&self.inner.self_info.label());
        guardian.send(message)
    }

    /// Sends `content` to every pooled peer with one freshly stamped header.
    ///
    /// Returns how many peers accepted it.  Per-peer failures are logged and
    /// do not affect the others.
    pub fn broadcast(&self, content: impl Into<String>) -> usize {
        let message = Message::stamped(self.inner.self_info.label(), content);
        let guardians: Vec<Guardian> = self
            .inner
            .pool()
            .entries()
            .map(|(_, entry)| entry.guardian.clone())
            .collect();

        let mut accepted = 0;
        for guardian in guardians {
            match guardian.send(message.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("broadcast to {} failed: {e}", guardian.key()),
            }
        }
        debug!("broadcast accepted by {accepted} peer(s)");
        accepted
    }

    /// Takes the merged inbound receiver.  Returns `None` after the first
    /// call.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner
            .inbound_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Takes the receiver of peers whose link failed: a dial that did not
    /// complete, or a pooled connection that closed without being removed.
    /// Returns `None` after the first call.
    pub fn take_link_failures(&self) -> Option<mpsc::Receiver<PeerKey>> {
        self.inner
            .failures_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Keys of every pooled connection.
    pub fn connected_peers(&self) -> Vec<PeerKey> {
        self.inner.pool().keys()
    }

    /// The local endpoint, advertising the bound port once started.
    pub fn self_info(&self) -> EndPoint {
        match self.inner.local_addr.get() {
            Some(addr) => self.inner.self_info.clone().with_transfer_port(addr.port()),
            None => self.inner.self_info.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    /// Stops the accept loop, the reaper and every Guardian.  Idempotent.
    pub fn stop(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let drained = self.inner.pool().drain();
        for entry in &drained {
            entry.guardian.stop();
        }
        info!(
            "transfer service stopped ({} connection(s) closed)",
            drained.len()
        );
    }

    fn local_hello(&self) -> Hello {
        Hello {
            endpoint: self.self_info(),
            node_id: self.inner.node_id,
        }
    }
}

#[async_trait]
impl PeerLinkHandler for Postman {
    async fn on_discovery_event(&self, event: DiscoveryEvent) {
        self.handle_discovery_event(&event).await;
    }
}

impl Inner {
    fn pool(&self) -> MutexGuard<'_, ConnectionPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn report_failure(&self, key: &PeerKey) {
        if let Err(e) = self.failures_tx.try_send(key.clone()) {
            debug!("link failure for {key} not reported: {e}");
        }
    }

    /// Offers a handshaken stream to the pool.  Spawns a Guardian if the
    /// stream wins; otherwise drops it.  Returns whether it was pooled.
    fn admit(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        endpoint: EndPoint,
        direction: Direction,
        remote_node_id: Uuid,
    ) -> bool {
        let key = endpoint.key().clone();

        let displaced = {
            let mut pool = self.pool();
            if self.is_stopped() {
                return false;
            }
            match pool.admission(&key, direction, remote_node_id, self.node_id) {
                Admission::Reject => {
                    debug!("keeping existing connection to {key}, dropping {direction:?} duplicate");
                    return false;
                }
                Admission::Vacant | Admission::Replace => {}
            }

            let guardian = Guardian::spawn(
                stream,
                key.clone(),
                &self.config.guardian,
                self.inbound_tx.clone(),
                self.exit_tx.clone(),
            );
            pool.insert(
                key.clone(),
                PoolEntry {
                    guardian,
                    remote_addr,
                    endpoint,
                    direction,
                    remote_node_id,
                },
            )
        };

        if let Some(old) = displaced {
            debug!("replacing {:?} connection to {key}", old.direction);
            old.guardian.stop();
        }
        info!("connected to {key} ({direction:?}, {remote_addr})");
        true
    }

    async fn accept_peer(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), TransferError> {
        let _ = stream.set_nodelay(true);
        let local = Hello {
            endpoint: match self.local_addr.get() {
                Some(bound) => self.self_info.clone().with_transfer_port(bound.port()),
                None => self.self_info.clone(),
            },
            node_id: self.node_id,
        };

        let hello = exchange_hello(&mut stream, &local, self.config.handshake_timeout).await?;
        let endpoint = hello.endpoint.with_address(addr.ip());
        self.admit(stream, addr, endpoint, Direction::Inbound, hello.node_id);
        Ok(())
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut stop_rx = inner.shutdown.subscribe();

    loop {
        let (stream, addr) = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        debug!("incoming transfer connection from {addr}");
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(e) = inner.accept_peer(stream, addr).await {
                warn!("rejected connection from {addr}: {e}");
            }
        });
    }

    debug!("accept loop stopped");
}

async fn reap_loop(inner: Arc<Inner>, mut exits: mpsc::UnboundedReceiver<GuardianExit>) {
    let mut stop_rx = inner.shutdown.subscribe();

    loop {
        let exit = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            exit = exits.recv() => match exit {
                Some(exit) => exit,
                None => break,
            },
        };

        let evicted = inner.pool().remove_if_current(&exit.key, exit.id);
        if evicted.is_some() {
            info!("connection to {} closed, evicted", exit.key);
            inner.report_failure(&exit.key);
        } else {
            debug!("stale exit notice for {} (guardian {})", exit.key, exit.id);
        }
    }

    debug!("reaper stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
