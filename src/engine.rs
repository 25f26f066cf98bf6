//! The migration engine: lifecycle controller over the scanner, the change
//! subscriber, the coalescing queue, and the metric emitter.
//!
//! A run goes Idle -> Validating -> Scanning -> SteadyState, and any state
//! reaches Stopped through `stop`. The change subscriber is activated
//! before the first scan page so a write landing mid-sweep is re-covered by
//! its event instead of being lost.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{EndpointConfig, EngineOptions};
use crate::error::{MigrationError, Result};
use crate::events::{EventBus, MigrationEvent};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::queue::UpdateQueue;
use crate::replicator::Replicator;
use crate::scanner::Scanner;
use crate::session::ConnectionPair;
use crate::stats::{MigrationStatus, StatsSnapshot, StatsTracker};
use crate::subscriber::{ensure_keyspace_notifications, Subscriber, KEYSPACE_PATTERN};

pub struct MigrationEngine {
    id: String,
    options: EngineOptions,
    sessions: ConnectionPair,
    lifecycle: Arc<Lifecycle>,
    stats: Arc<StatsTracker>,
    queue: Arc<UpdateQueue>,
    events: EventBus,
    replicator: Arc<Replicator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MigrationEngine {
    /// Build an engine over already-opened sessions. An empty
    /// `migration_id` gets a generated one.
    pub fn new(
        sessions: ConnectionPair,
        migration_id: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        let mut id = migration_id.into();
        if id.is_empty() {
            id = Uuid::new_v4().to_string();
        }
        let lifecycle = Arc::new(Lifecycle::new());
        let stats = Arc::new(StatsTracker::new());
        let events = EventBus::new();
        let replicator = Arc::new(Replicator::new(
            Arc::clone(&sessions.source),
            Arc::clone(&sessions.target),
            Arc::clone(&stats),
            events.clone(),
        ));
        Self {
            id,
            options,
            sessions,
            lifecycle,
            stats,
            queue: Arc::new(UpdateQueue::new()),
            events,
            replicator,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Open all three sessions and build an engine over them.
    pub async fn connect(
        source_cfg: &EndpointConfig,
        target_cfg: &EndpointConfig,
        migration_id: impl Into<String>,
        options: EngineOptions,
    ) -> Result<Self> {
        let sessions = ConnectionPair::connect(source_cfg, target_cfg).await?;
        Ok(Self::new(sessions, migration_id, options))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MigrationEvent> {
        self.events.subscribe()
    }

    /// Pre-flight check without starting a run. Failure closes all
    /// sessions.
    pub async fn validate(&self) -> Result<()> {
        self.sessions.validate().await
    }

    /// Run the migration up to steady state: validate, activate the change
    /// subscriber, sweep the source keyspace.
    ///
    /// Returns once the bulk sweep finished; with realtime sync enabled the
    /// subscriber and drain worker keep converging changes in the
    /// background until `stop`. Fatal errors stop the engine and propagate.
    pub async fn start(&self) -> Result<()> {
        if !self.lifecycle.try_begin() {
            return Err(MigrationError::AlreadyRunning);
        }
        self.stats.reset();
        self.lifecycle.set_state(LifecycleState::Validating);
        info!(id = %self.id, "starting migration");

        match self.run_to_steady_state().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(id = %self.id, %err, "migration failed");
                self.stats.record_error(err.to_string());
                self.stats.set_status(MigrationStatus::Failed);
                self.events.emit(MigrationEvent::Error {
                    message: err.to_string(),
                });
                self.stop().await;
                Err(err)
            }
        }
    }

    async fn run_to_steady_state(&self) -> Result<()> {
        self.sessions.validate().await?;

        if self.options.enable_realtime_sync {
            // subscriber must be live before the first scan page so writes
            // during the sweep are re-covered by their events
            ensure_keyspace_notifications(self.sessions.source.as_ref()).await?;
            let rx = self
                .sessions
                .events
                .subscribe(KEYSPACE_PATTERN)
                .await
                .map_err(|e| MigrationError::Subscriber(e.to_string()))?;
            let subscriber = Arc::new(Subscriber::new(
                Arc::clone(&self.replicator),
                Arc::clone(&self.queue),
                Arc::clone(&self.lifecycle),
                self.options.chunk_size,
            ));
            self.tasks.lock().push(tokio::spawn(subscriber.run(rx)));
            self.lifecycle.set_sync_enabled(true);
        }

        self.spawn_metric_emitter();

        self.lifecycle.set_state(LifecycleState::Scanning);
        let total = self.sessions.source.dbsize().await?;
        self.stats.set_total(total);
        info!(id = %self.id, total, "bulk scan starting");

        let scanner = Scanner::new(
            Arc::clone(&self.sessions.source),
            Arc::clone(&self.replicator),
            Arc::clone(&self.stats),
            Arc::clone(&self.lifecycle),
            self.options.batch_size,
            self.options.chunk_size,
        );
        let scanned = scanner.run().await?;

        info!(id = %self.id, scanned, "bulk scan complete");
        self.events.emit(MigrationEvent::ScanComplete { scanned });
        self.lifecycle.set_state(LifecycleState::SteadyState);
        if !self.options.enable_realtime_sync {
            self.stats.set_status(MigrationStatus::Completed);
        }
        Ok(())
    }

    fn spawn_metric_emitter(&self) {
        let stats = Arc::clone(&self.stats);
        let lifecycle = Arc::clone(&self.lifecycle);
        let events = self.events.clone();
        let source = Arc::clone(&self.sessions.source);
        let interval = self.options.metric_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !lifecycle.is_running() {
                    break;
                }
                if lifecycle.state() == LifecycleState::SteadyState {
                    // the source total keeps moving while writes continue
                    if let Ok(total) = source.dbsize().await {
                        stats.set_total(total);
                    }
                }
                events.emit(MigrationEvent::Metrics(stats.snapshot()));
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop the migration and release every resource. Best-effort and
    /// idempotent; never fails past cleanup.
    ///
    /// Order matters: new enqueues are refused first, then the background
    /// tasks go away, then the pending set is dropped, then the sessions
    /// close.
    pub async fn stop(&self) {
        if self.lifecycle.state() == LifecycleState::Stopped {
            return;
        }
        info!(id = %self.id, "stopping migration");
        self.lifecycle.set_state(LifecycleState::Stopping);
        self.lifecycle.set_sync_enabled(false);
        self.lifecycle.set_running(false);

        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.queue.shutdown();
        self.sessions.events.unsubscribe().await;
        self.sessions.close().await;

        if matches!(
            self.stats.status(),
            MigrationStatus::Pending | MigrationStatus::Running
        ) {
            self.stats.set_status(MigrationStatus::Stopped);
        }
        self.lifecycle.set_state(LifecycleState::Stopped);
        self.events.emit(MigrationEvent::Stopped);
    }

    /// Freeze the subscriber's effects without tearing the subscription
    /// down. Events arriving while paused are dropped, not buffered.
    pub fn pause_sync(&self) {
        if !self.lifecycle.sync_enabled() {
            return;
        }
        self.lifecycle.set_sync_enabled(false);
        info!(id = %self.id, "realtime sync paused");
        self.events.emit(MigrationEvent::SyncPaused);
    }

    /// Re-enable the subscriber's effects after a pause.
    pub fn resume_sync(&self) {
        if !self.lifecycle.is_running()
            || !self.options.enable_realtime_sync
            || self.lifecycle.sync_enabled()
        {
            return;
        }
        self.lifecycle.set_sync_enabled(true);
        info!(id = %self.id, "realtime sync resumed");
        self.events.emit(MigrationEvent::SyncResumed);
    }

    /// Close all sessions. Idempotent; tolerates sessions that never
    /// opened.
    pub async fn cleanup(&self) {
        self.sessions.close().await;
    }
}

impl Drop for MigrationEngine {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.queue.shutdown();
    }
}
