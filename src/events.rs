//! Typed events emitted by the engine.
//!
//! The observer surface is a broadcast channel of [`MigrationEvent`]; the
//! control plane subscribes and fans the stream out to its UI. Events are
//! point-in-time and never replayed; a slow subscriber that lags past the
//! channel capacity loses the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::stats::StatsSnapshot;

/// What happened to a key on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOperation {
    /// Value carried over.
    Update,
    /// Key removed from the target.
    Delete,
    /// Expiry re-applied.
    Expire,
    /// List rebuilt in order.
    ListUpdate,
}

impl std::fmt::Display for KeyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Expire => write!(f, "expire"),
            Self::ListUpdate => write!(f, "list_update"),
        }
    }
}

/// An event on the engine's observer surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MigrationEvent {
    /// Counters after one replication.
    Progress {
        processed: u64,
        total: u64,
        percent: f64,
        rate: f64,
        bytes: u64,
    },
    /// One key was carried over, deleted, or re-expired on the target.
    KeyProcessed { key: String, operation: KeyOperation },
    /// The bulk sweep finished.
    ScanComplete { scanned: u64 },
    /// Periodic full counter snapshot.
    Metrics(StatsSnapshot),
    /// Realtime sync was paused; events are dropped until resume.
    SyncPaused,
    /// Realtime sync was resumed.
    SyncResumed,
    /// The engine stopped and closed its sessions.
    Stopped,
    /// A recoverable error was recorded.
    Error { message: String },
}

const EVENT_BUS_CAPACITY: usize = 1024;

/// Broadcast fan-out for [`MigrationEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MigrationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Open a new subscription. Only events emitted after this call are
    /// delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationEvent> {
        self.tx.subscribe()
    }

    /// Emit to all current subscribers. Emitting with no subscribers is
    /// fine; the event is dropped.
    pub(crate) fn emit(&self, event: MigrationEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
