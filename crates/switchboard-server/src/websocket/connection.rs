//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchboard_core::{ConnectionId, Principal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connected, authenticated WebSocket client.
///
/// Owned by the registry through an `Arc`; the session loop holds the
/// receiving end of `tx` and watches `close` to know when to hang up.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    principal: Principal,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat tick.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    /// Count of messages dropped because the queue was full or closed.
    pub dropped_messages: AtomicU64,
    close: CancellationToken,
}

impl ClientConnection {
    /// Create a connection with a fresh ID.
    pub fn new(principal: Principal, tx: mpsc::Sender<Arc<String>>, close: CancellationToken) -> Self {
        Self::with_id(ConnectionId::new(), principal, tx, close)
    }

    /// Create a connection with a caller-chosen ID.
    pub fn with_id(
        id: ConnectionId,
        principal: Principal,
        tx: mpsc::Sender<Arc<String>>,
        close: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            principal,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            close,
        }
    }

    /// The authenticated owner of this connection.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Queue a text frame without waiting.
    ///
    /// Returns `false` if the queue is full or the writer is gone, and
    /// increments the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (pong or any frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last recorded activity.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the client was active since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Ask the session loop to hang up. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether `close` has been requested (directly or via server shutdown).
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the connection has been asked to close.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("dropped_messages", &self.drop_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
