//! Coalescing queue of keys awaiting re-replication.
//!
//! A set of pending keys plus a single drain worker. Inserting a key that
//! is already pending is a no-op, so a key that changes many times while a
//! drain is in flight is re-replicated at most once more, in the next pass.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use crate::lifecycle::Lifecycle;

pub struct UpdateQueue {
    pending: Mutex<HashSet<String>>,
    draining: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashSet::new()),
            draining: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Insert `key` into the pending set. Returns `false` when the key was
    /// already queued.
    pub fn enqueue(&self, key: &str) -> bool {
        self.pending.lock().insert(key.to_string())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drop all pending keys without replicating them.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Abort the drain worker and drop the pending set. Called on stop.
    pub fn shutdown(&self) {
        self.clear();
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        self.draining.store(false, Ordering::SeqCst);
    }

    fn take_pending(&self) -> HashSet<String> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Start the drain worker unless one is already running.
    ///
    /// The worker swaps the pending set for an empty one, replicates the
    /// snapshot with at most `concurrency` tasks in flight, and repeats
    /// until the set stays empty. Per-key failures are recorded by
    /// `replicate` itself and do not abort the drain.
    pub fn kick<F, Fut>(self: Arc<Self>, concurrency: usize, lifecycle: Arc<Lifecycle>, replicate: F)
    where
        F: Fn(String) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.draining.swap(true, Ordering::SeqCst) {
            // an active worker will pick the new arrivals up
            return;
        }
        let queue = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            queue.drain_loop(concurrency, lifecycle, replicate).await;
        });
        *self.worker.lock() = Some(handle);
    }

    async fn drain_loop<F, Fut>(&self, concurrency: usize, lifecycle: Arc<Lifecycle>, replicate: F)
    where
        F: Fn(String) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            loop {
                let snapshot = self.take_pending();
                if snapshot.is_empty() {
                    break;
                }
                debug!(keys = snapshot.len(), "draining pending updates");
                self.drain_batch(snapshot, concurrency, &lifecycle, &replicate)
                    .await;
                if !lifecycle.is_running() {
                    self.draining.store(false, Ordering::SeqCst);
                    return;
                }
            }

            self.draining.store(false, Ordering::SeqCst);
            // A key may have slipped in between the empty snapshot and the
            // flag clear; reclaim the flag and go again, unless another
            // kick already did.
            if self.is_empty() || self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    async fn drain_batch<F, Fut>(
        &self,
        keys: HashSet<String>,
        concurrency: usize,
        lifecycle: &Lifecycle,
        replicate: &F,
    ) where
        F: Fn(String) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for key in keys {
            if !lifecycle.is_running() {
                break;
            }
            while tasks.len() >= concurrency.max(1) {
                tasks.join_next().await;
            }
            tasks.spawn(replicate(key));
        }
        while tasks.join_next().await.is_some() {}
    }
}

impl Default for UpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}
