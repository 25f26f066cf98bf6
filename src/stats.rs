//! Running migration counters and point-in-time snapshots.
//!
//! Counter fields use atomics so concurrent replication tasks update
//! progress without locking; the error list and the start instant sit
//! behind `parking_lot` locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Overall status of the migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Not started yet.
    Pending,
    /// Actively scanning or in steady state.
    Running,
    /// One-shot snapshot finished.
    Completed,
    /// A fatal error ended the run.
    Failed,
    /// Stopped by the caller.
    Stopped,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Hard cap on the number of retained error messages.
const MAX_TRACKED_ERRORS: usize = 100;
/// How many of the most recent errors a snapshot carries.
const SNAPSHOT_ERRORS: usize = 10;

/// A point-in-time snapshot of all migration counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Overall run status.
    pub status: MigrationStatus,
    /// Keys replicated so far.
    pub processed: u64,
    /// Keys on the source at the last count.
    pub total: u64,
    /// Completion percentage, capped at 100.
    pub percent: f64,
    /// Replication throughput in keys per second.
    pub rate: f64,
    /// Bytes of key material carried over.
    pub bytes: u64,
    /// Seconds since the run started.
    pub elapsed_secs: f64,
    /// Most recent error messages, truncated.
    pub errors: Vec<String>,
    /// ISO-8601 timestamp of this snapshot.
    pub timestamp: String,
}

/// Running migration counters.
pub struct StatsTracker {
    status: RwLock<MigrationStatus>,
    processed: AtomicU64,
    total: AtomicU64,
    bytes: AtomicU64,
    started_at: RwLock<Instant>,
    errors: RwLock<Vec<String>>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(MigrationStatus::Pending),
            processed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            started_at: RwLock::new(Instant::now()),
            errors: RwLock::new(Vec::new()),
        }
    }

    /// Zero every counter and restart the clock. A restarted migration is
    /// a full restart.
    pub fn reset(&self) {
        *self.status.write() = MigrationStatus::Running;
        self.processed.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        *self.started_at.write() = Instant::now();
        self.errors.write().clear();
    }

    pub fn status(&self) -> MigrationStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: MigrationStatus) {
        *self.status.write() = status;
    }

    /// Record one successfully replicated key and the bytes it carried.
    pub fn record_key(&self, bytes: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Refresh the source's key count. `processed` may momentarily exceed
    /// a shrinking total (keys deleted mid-sweep still count once); reads
    /// clamp, so observers never see processed above total.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: String) {
        let mut errors = self.errors.write();
        if errors.len() == MAX_TRACKED_ERRORS {
            errors.remove(0);
        }
        errors.push(message);
    }

    pub fn error_count(&self) -> usize {
        self.errors.read().len()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed).min(self.total())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Completion percentage, capped at 100. An empty source counts as
    /// fully migrated.
    pub fn percent(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        let processed = self.processed();
        (processed as f64 / total as f64 * 100.0).min(100.0)
    }

    /// Throughput in keys per second since the run started.
    pub fn rate(&self) -> f64 {
        let elapsed = self.started_at.read().elapsed().as_secs_f64();
        if elapsed < f64::EPSILON {
            return 0.0;
        }
        self.processed() as f64 / elapsed
    }

    /// Take a snapshot of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let errors = {
            let errors = self.errors.read();
            let skip = errors.len().saturating_sub(SNAPSHOT_ERRORS);
            errors[skip..].to_vec()
        };
        StatsSnapshot {
            status: self.status(),
            processed: self.processed(),
            total: self.total(),
            percent: self.percent(),
            rate: self.rate(),
            bytes: self.bytes(),
            elapsed_secs: self.started_at.read().elapsed().as_secs_f64(),
            errors,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}
