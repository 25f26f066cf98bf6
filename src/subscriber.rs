//! Change-data-capture over the source's keyspace notifications.
//!
//! Each notification is classified into an intent. Deletes, TTL changes,
//! and list mutations are applied inline on the subscriber task; everything
//! else that mutates a key is coalesced through the update queue. List
//! mutations skip the queue because a rebuild is delete-then-append and
//! already idempotent per trigger.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{MigrationError, Result};
use crate::lifecycle::Lifecycle;
use crate::queue::UpdateQueue;
use crate::replicator::Replicator;
use crate::session::{KeyspaceEvent, Session};

/// Subscription pattern covering every key in database 0.
pub const KEYSPACE_PATTERN: &str = "__keyspace@0__:*";

/// Notification classes the engine needs: keyspace channels, keyevent
/// channels, and all event categories.
const REQUIRED_NOTIFY_CLASSES: [char; 3] = ['K', 'E', 'A'];

/// What the engine does in response to a keyspace operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeIntent {
    /// Remove the key from the target.
    Delete,
    /// Re-apply the source's TTL on the target.
    TtlSync,
    /// Rebuild the list in full, inline.
    ListRebuild,
    /// Coalesce through the update queue and re-replicate.
    Replicate,
    /// Not an operation the engine reacts to.
    Ignore,
}

/// Map a keyspace operation name to the action taken for it.
pub fn classify(operation: &str) -> ChangeIntent {
    match operation {
        "del" => ChangeIntent::Delete,
        "expire" => ChangeIntent::TtlSync,
        "lpush" | "rpush" | "lpop" | "rpop" | "lset" | "lrem" | "ltrim" | "linsert" => {
            ChangeIntent::ListRebuild
        }
        "set" | "hset" | "sadd" | "zadd" => ChangeIntent::Replicate,
        _ => ChangeIntent::Ignore,
    }
}

/// Make sure the source publishes notifications for every event class the
/// engine depends on, reconfiguring it when any class is missing.
pub async fn ensure_keyspace_notifications(session: &dyn Session) -> Result<()> {
    let current = session
        .notify_config()
        .await
        .map_err(|e| MigrationError::Configuration(e.to_string()))?;
    if REQUIRED_NOTIFY_CLASSES.iter().all(|c| current.contains(*c)) {
        debug!(flags = %current, "keyspace notifications already enabled");
        return Ok(());
    }
    info!(flags = %current, "enabling keyspace notifications on source");
    session
        .set_notify_config("KEA")
        .await
        .map_err(|e| MigrationError::Configuration(e.to_string()))?;
    Ok(())
}

/// Long-lived consumer of the keyspace event channel.
///
/// Exactly one of these runs per migration, started after the notification
/// configuration step and before the first scan page. Errors from applying
/// an event are recorded and the stream stays alive.
pub struct Subscriber {
    replicator: Arc<Replicator>,
    queue: Arc<UpdateQueue>,
    lifecycle: Arc<Lifecycle>,
    chunk_size: usize,
}

impl Subscriber {
    pub fn new(
        replicator: Arc<Replicator>,
        queue: Arc<UpdateQueue>,
        lifecycle: Arc<Lifecycle>,
        chunk_size: usize,
    ) -> Self {
        Self {
            replicator,
            queue,
            lifecycle,
            chunk_size,
        }
    }

    /// Consume keyspace events until the channel closes.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<KeyspaceEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.lifecycle.sync_enabled() {
                // paused: drop, never buffer
                continue;
            }
            self.handle(event).await;
        }
        debug!("keyspace event channel closed");
    }

    async fn handle(&self, event: KeyspaceEvent) {
        let intent = classify(&event.operation);
        debug!(key = %event.key, operation = %event.operation, ?intent, "keyspace event");
        match intent {
            ChangeIntent::Ignore => {}
            ChangeIntent::Replicate => {
                self.queue.enqueue(&event.key);
                let replicator = Arc::clone(&self.replicator);
                Arc::clone(&self.queue).kick(
                    self.chunk_size,
                    Arc::clone(&self.lifecycle),
                    move |key: String| {
                        let replicator = Arc::clone(&replicator);
                        async move {
                            let _ = replicator.replicate(&key).await;
                        }
                    },
                );
            }
            ChangeIntent::Delete | ChangeIntent::ListRebuild => {
                let _ = self.replicator.replicate(&event.key).await;
            }
            ChangeIntent::TtlSync => {
                let _ = self.replicator.sync_ttl(&event.key).await;
            }
        }
    }
}
