//! Type-aware replication of one key from source to target.
//!
//! The replicator reads a key's kind, contents, and TTL from the source and
//! writes an equivalent representation to the target. A key that is gone
//! from the source is deleted on the target through the same path, which is
//! how delete events and keys lost between scan and copy are handled.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MigrationError, Result};
use crate::events::{EventBus, KeyOperation, MigrationEvent};
use crate::session::{KeyKind, Session, TTL_MISSING};
use crate::stats::StatsTracker;

pub struct Replicator {
    source: Arc<dyn Session>,
    target: Arc<dyn Session>,
    stats: Arc<StatsTracker>,
    events: EventBus,
}

impl Replicator {
    pub fn new(
        source: Arc<dyn Session>,
        target: Arc<dyn Session>,
        stats: Arc<StatsTracker>,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            target,
            stats,
            events,
        }
    }

    /// Copy the current state of `key` from source to target.
    ///
    /// Counters advance only here and only on success. A failure is
    /// recorded in the stats and surfaced as an `error` event; the caller
    /// decides whether to continue (per-key callers always do).
    pub async fn replicate(&self, key: &str) -> Result<KeyOperation> {
        match self.copy_key(key).await {
            Ok((operation, bytes)) => {
                self.stats.record_key(bytes);
                self.events.emit(MigrationEvent::KeyProcessed {
                    key: key.to_string(),
                    operation,
                });
                self.emit_progress();
                debug!(key, operation = %operation, "key replicated");
                Ok(operation)
            }
            Err(err) => {
                let err = match err {
                    unsupported @ MigrationError::UnsupportedType { .. } => unsupported,
                    other => MigrationError::KeyReplication {
                        key: key.to_string(),
                        source: Box::new(other),
                    },
                };
                warn!(key, %err, "key replication failed");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Re-apply the source's TTL for `key` on the target. Used for expire
    /// events; does not advance the processed counter.
    pub async fn sync_ttl(&self, key: &str) -> Result<()> {
        match self.copy_ttl(key).await {
            Ok(applied) => {
                if applied {
                    self.events.emit(MigrationEvent::KeyProcessed {
                        key: key.to_string(),
                        operation: KeyOperation::Expire,
                    });
                    debug!(key, "ttl synced");
                }
                Ok(())
            }
            Err(err) => {
                let err = MigrationError::KeyReplication {
                    key: key.to_string(),
                    source: Box::new(err),
                };
                warn!(key, %err, "ttl sync failed");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn copy_key(&self, key: &str) -> Result<(KeyOperation, u64)> {
        if !self.source.exists(key).await? {
            self.target.delete(key).await?;
            return Ok((KeyOperation::Delete, 0));
        }

        let kind = self.source.key_kind(key).await?;
        let ttl = self.source.ttl(key).await?;
        if ttl == TTL_MISSING {
            // vanished between the exists check and the TTL read
            self.target.delete(key).await?;
            return Ok((KeyOperation::Delete, 0));
        }

        let mut bytes = key.len() as u64;
        let operation = match kind {
            KeyKind::Scalar => match self.source.get_scalar(key).await? {
                Some(value) => {
                    bytes += value.len() as u64;
                    self.target.put_scalar(key, &value).await?;
                    KeyOperation::Update
                }
                None => {
                    self.target.delete(key).await?;
                    return Ok((KeyOperation::Delete, 0));
                }
            },
            KeyKind::Map => {
                let fields = self.source.get_map(key).await?;
                if !fields.is_empty() {
                    bytes += fields
                        .iter()
                        .map(|(f, v)| (f.len() + v.len()) as u64)
                        .sum::<u64>();
                    self.target.put_map(key, &fields).await?;
                }
                KeyOperation::Update
            }
            KeyKind::UnorderedSet => {
                let members = self.source.get_set(key).await?;
                if !members.is_empty() {
                    bytes += members.iter().map(|m| m.len() as u64).sum::<u64>();
                    self.target.add_set_members(key, &members).await?;
                }
                KeyOperation::Update
            }
            KeyKind::OrderedSet => {
                let members = self.source.get_sorted_set(key).await?;
                if !members.is_empty() {
                    bytes += members.iter().map(|(m, _)| m.len() as u64).sum::<u64>();
                    self.target.add_sorted_members(key, &members).await?;
                }
                KeyOperation::Update
            }
            KeyKind::List => {
                let items = self.source.get_list(key).await?;
                // Re-pushed lists accumulate; a rebuild must start empty to
                // preserve order and length.
                self.target.delete(key).await?;
                if !items.is_empty() {
                    bytes += items.iter().map(|i| i.len() as u64).sum::<u64>();
                    self.target.push_list_items(key, &items).await?;
                }
                KeyOperation::ListUpdate
            }
            KeyKind::Other(tag) => {
                return Err(MigrationError::UnsupportedType {
                    key: key.to_string(),
                    kind: tag,
                });
            }
        };

        if ttl > 0 {
            self.target.expire(key, ttl).await?;
        }
        Ok((operation, bytes))
    }

    async fn copy_ttl(&self, key: &str) -> Result<bool> {
        let ttl = self.source.ttl(key).await?;
        if ttl > 0 {
            self.target.expire(key, ttl).await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn record_failure(&self, err: &MigrationError) {
        self.stats.record_error(err.to_string());
        self.events.emit(MigrationEvent::Error {
            message: err.to_string(),
        });
    }

    fn emit_progress(&self) {
        self.events.emit(MigrationEvent::Progress {
            processed: self.stats.processed(),
            total: self.stats.total(),
            percent: self.stats.percent(),
            rate: self.stats.rate(),
            bytes: self.stats.bytes(),
        });
    }
}
