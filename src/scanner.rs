//! Cursor-driven bulk sweep of the source keyspace.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{MigrationError, Result};
use crate::lifecycle::Lifecycle;
use crate::replicator::Replicator;
use crate::session::Session;
use crate::stats::StatsTracker;

/// Paginated sweep that hands each page of keys to the replicator with
/// bounded parallelism. The sweep holds no cursor state across runs; a
/// stopped scan starts over on the next migration.
pub struct Scanner {
    source: Arc<dyn Session>,
    replicator: Arc<Replicator>,
    stats: Arc<StatsTracker>,
    lifecycle: Arc<Lifecycle>,
    batch_size: usize,
    chunk_size: usize,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn Session>,
        replicator: Arc<Replicator>,
        stats: Arc<StatsTracker>,
        lifecycle: Arc<Lifecycle>,
        batch_size: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            source,
            replicator,
            stats,
            lifecycle,
            batch_size,
            chunk_size,
        }
    }

    /// Run the sweep to completion and return how many keys it visited.
    ///
    /// Source I/O failures on the scan itself are fatal and propagate;
    /// per-key replication failures are recorded by the replicator and the
    /// sweep continues. The source's key count is re-read after every page
    /// so progress tracks a moving total.
    pub async fn run(&self) -> Result<u64> {
        let mut cursor = 0u64;
        let mut scanned = 0u64;

        loop {
            if !self.lifecycle.is_running() {
                info!("bulk scan interrupted by shutdown");
                break;
            }

            let (next_cursor, keys) = self
                .source
                .scan(cursor, self.batch_size)
                .await
                .map_err(MigrationError::Session)?;
            debug!(cursor, page_keys = keys.len(), "scan page");
            scanned += keys.len() as u64;
            self.replicate_page(keys).await;

            match self.source.dbsize().await {
                Ok(total) => self.stats.set_total(total),
                Err(err) => warn!(%err, "key count refresh failed"),
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(scanned)
    }

    async fn replicate_page(&self, keys: Vec<String>) {
        let mut tasks = JoinSet::new();
        for key in keys {
            if !self.lifecycle.is_running() {
                break;
            }
            while tasks.len() >= self.chunk_size.max(1) {
                tasks.join_next().await;
            }
            let replicator = Arc::clone(&self.replicator);
            tasks.spawn(async move {
                // failures are recorded inside the replicator
                let _ = replicator.replicate(&key).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
