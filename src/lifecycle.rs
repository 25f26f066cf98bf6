//! Lifecycle state machine for a migration run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where the engine is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Constructed, not started.
    Idle,
    /// Pre-flight checks against both endpoints.
    Validating,
    /// Bulk sweep of the source keyspace in progress.
    Scanning,
    /// Sweep finished; only change events drive replication.
    SteadyState,
    /// Shutdown in progress.
    Stopping,
    /// All sessions closed; a new run requires a fresh start.
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Validating => write!(f, "validating"),
            Self::Scanning => write!(f, "scanning"),
            Self::SteadyState => write!(f, "steady_state"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Shared lifecycle flags checked by every engine task.
///
/// `running` gates the scanner page loop and the drain worker;
/// `sync_enabled` gates the effects of the change subscriber without
/// tearing down the subscription.
#[derive(Debug)]
pub struct Lifecycle {
    state: RwLock<LifecycleState>,
    running: AtomicBool,
    sync_enabled: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LifecycleState::Idle),
            running: AtomicBool::new(false),
            sync_enabled: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write();
        let prev = *state;
        *state = next;
        drop(state);
        debug!(from = %prev, to = %next, "lifecycle transition");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the run. Returns `false` when a run is already active.
    pub(crate) fn try_begin(&self) -> bool {
        !self.running.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
