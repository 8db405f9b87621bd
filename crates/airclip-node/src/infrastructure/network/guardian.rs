//! Per-connection worker pair.
//!
//! A [`Guardian`] owns one already-handshaken stream.  It splits the stream
//! and runs two tasks:
//!
//! ```text
//!               outbound queue (bounded, try_send)
//!   send() ───────────────────────────► writer task ──► write half
//!
//!   read half ──► reader task ──► shared inbound channel (bounded, send().await)
//! ```
//!
//! A third task joins both and posts a [`GuardianExit`] notice so the pool can
//! evict the entry.  Either task failing stops the other through the shared
//! shutdown flag.
//!
//! Outbound sends never block: a full queue is reported as
//! [`TransferError::QueueFull`].  Inbound delivery does block, so a slow
//! consumer back-pressures the reader and, through TCP, the remote peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use airclip_core::{Message, PeerKey, TransferFrame};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

use super::postman::TransferError;
use super::stopped;
use super::wire::{read_frame, write_frame};

/// Upper bound on the flush performed by a stopping writer.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_GUARDIAN_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    /// Outbound queue capacity.
    pub outbound_queue: usize,
    /// Whether `stop()` writes out messages that were already accepted.
    pub flush_on_stop: bool,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            flush_on_stop: true,
        }
    }
}

/// Notice posted when both of a Guardian's tasks have finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianExit {
    pub key: PeerKey,
    pub id: u64,
}

/// Handle to a running connection.  Cheap to clone; all clones address the
/// same tasks.
#[derive(Debug, Clone)]
pub struct Guardian {
    id: u64,
    key: PeerKey,
    outbound: mpsc::Sender<Message>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Guardian {
    /// Spawns the reader, writer and supervisor tasks for `stream`.
    ///
    /// Inbound messages go to `inbound`; the exit notice goes to `exits`.
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(
        stream: S,
        key: PeerKey,
        config: &GuardianConfig,
        inbound: mpsc::Sender<Message>,
        exits: mpsc::UnboundedSender<GuardianExit>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_GUARDIAN_ID.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let (read_half, write_half) = tokio::io::split(stream);

        let reader = tokio::spawn(read_loop(
            read_half,
            key.clone(),
            inbound,
            Arc::clone(&shutdown),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            key.clone(),
            outbound_rx,
            Arc::clone(&shutdown),
            config.flush_on_stop,
        ));

        let exit_key = key.clone();
        tokio::spawn(async move {
            let _ = reader.await;
            let _ = writer.await;
            debug!("guardian {id} for {exit_key} finished");
            let _ = exits.send(GuardianExit { key: exit_key, id });
        });

        debug!("guardian {id} started for {key}");
        Self {
            id,
            key,
            outbound: outbound_tx,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    /// Returns `true` once `stop()` was called or either task has failed.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Queues `message` for the writer without waiting.
    ///
    /// # Errors
    ///
    /// [`TransferError::QueueFull`] if the outbound queue is at capacity,
    /// [`TransferError::GuardianClosed`] after the Guardian has stopped.
    pub fn send(&self, message: Message) -> Result<(), TransferError> {
        if self.is_closed() {
            return Err(TransferError::GuardianClosed(self.key.clone()));
        }
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransferError::QueueFull(self.key.clone()),
            TrySendError::Closed(_) => TransferError::GuardianClosed(self.key.clone()),
        })
    }

    /// Signals both tasks to finish.  Idempotent; returns immediately.
    ///
    /// A frame the writer has already started is completed.  With
    /// `flush_on_stop` the rest of the queue follows; either way the whole
    /// wind-down is bounded by [`FLUSH_TIMEOUT`], and anything not written
    /// is counted in a warning.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("guardian {} for {} stopping", self.id, self.key);
        }
    }

    /// Resolves once the Guardian is closed.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        stopped(&mut rx).await;
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn read_loop<R>(
    mut reader: R,
    key: PeerKey,
    inbound: mpsc::Sender<Message>,
    shutdown: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
{
    let mut stop_rx = shutdown.subscribe();

    loop {
        let frame = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            frame = read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(TransferFrame::Message(message))) => {
                debug!("message from {key}: {} bytes", message.content().len());
                tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    sent = inbound.send(message) => {
                        if sent.is_err() {
                            debug!("inbound channel closed, dropping reader for {key}");
                            break;
                        }
                    }
                }
            }
            Ok(Some(TransferFrame::Hello(hello))) => {
                warn!(
                    "unexpected hello from {key} after handshake (node {}), ignoring",
                    hello.node_id
                );
            }
            Ok(None) => {
                info!("connection to {key} closed by peer");
                break;
            }
            Err(e) => {
                warn!("read error on connection to {key}: {e}");
                break;
            }
        }
    }

    shutdown.send_replace(true);
}

async fn write_loop<W>(
    mut writer: W,
    key: PeerKey,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: Arc<watch::Sender<bool>>,
    flush_on_stop: bool,
) where
    W: AsyncWrite + Unpin,
{
    let mut stop_rx = shutdown.subscribe();
    // Set once stop is seen; bounds the in-flight write and the flush together.
    let mut deadline: Option<Instant> = None;
    // Cleared when a write failed or did not finish before the deadline.
    let mut stream_usable = true;
    // Accepted messages that never made it onto the wire.
    let mut lost = 0usize;

    loop {
        let message = tokio::select! {
            biased;
            _ = stopped(&mut stop_rx) => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // A frame that has started is always finished: stop only starts the
        // flush clock.
        let frame = TransferFrame::Message(message);
        let write = write_frame(&mut writer, &frame);
        tokio::pin!(write);
        let written = tokio::select! {
            written = &mut write => Some(written),
            _ = stopped(&mut stop_rx) => {
                let limit = *deadline.get_or_insert_with(|| Instant::now() + FLUSH_TIMEOUT);
                timeout_at(limit, &mut write).await.ok()
            }
        };

        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!("write error on connection to {key}: {e}");
                stream_usable = false;
                lost += 1;
                break;
            }
            None => {
                warn!("write to {key} did not finish before the flush deadline");
                stream_usable = false;
                lost += 1;
                break;
            }
        }
    }

    shutdown.send_replace(true);
    outbound.close();

    if flush_on_stop && stream_usable {
        let limit = deadline.unwrap_or_else(|| Instant::now() + FLUSH_TIMEOUT);
        let mut count = 0usize;
        let flushed = timeout_at(limit, async {
            while let Ok(message) = outbound.try_recv() {
                write_frame(&mut writer, &TransferFrame::Message(message)).await?;
                count += 1;
            }
            Ok::<(), TransferError>(())
        })
        .await;

        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("flush to {key} failed: {e}");
                lost += 1;
            }
            Err(_) => {
                warn!("flush to {key} timed out");
                lost += 1;
            }
        }
        if count > 0 {
            debug!("flushed {count} queued message(s) to {key}");
        }
    }

    while outbound.try_recv().is_ok() {
        lost += 1;
    }
    if lost > 0 {
        warn!("discarded {lost} accepted message(s) for {key}");
    }

    let _ = writer.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
