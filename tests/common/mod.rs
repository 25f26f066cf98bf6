//! Shared test utilities for keyhaul integration tests.
//!
//! Import via `mod common;` in integration test files. Provides an
//! in-memory key-value store with sessions implementing the engine's
//! [`Session`] / [`EventSource`] traits, plus a fixture wiring a full
//! engine over them.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use keyhaul::error::{SessionError, SessionResult};
use keyhaul::session::{
    ConnectionPair, EventSource, KeyKind, KeyspaceEvent, ServerIdentity, Session, TTL_NONE,
};
use keyhaul::{EngineOptions, MigrationEngine};

// ============================================================================
// In-memory store
// ============================================================================

/// A typed value in the in-memory store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(String),
    Map(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    SortedSet(Vec<(String, f64)>),
    List(Vec<String>),
}

/// A stored entry: value plus TTL in seconds (`-1` = no expiry).
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub ttl: i64,
}

/// Shared in-memory keyspace. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<BTreeMap<String, Entry>>>,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, value: Value) {
        self.put_with_ttl(key, value, TTL_NONE);
    }

    pub fn put_with_ttl(&self, key: &str, value: Value, ttl: i64) {
        self.inner
            .lock()
            .insert(key.to_string(), Entry { value, ttl });
    }

    pub fn put_scalar(&self, key: &str, value: &str) {
        self.put(key, Value::Scalar(value.to_string()));
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.inner.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn scalar(&self, key: &str) -> Option<String> {
        match self.entry(key)?.value {
            Value::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

// ============================================================================
// In-memory session
// ============================================================================

type ScanHook = Box<dyn FnMut(u64) + Send>;

/// A [`Session`] over a [`MemoryStore`], with failure injection and a scan
/// hook for mid-sweep mutations.
pub struct MemorySession {
    store: MemoryStore,
    identity: ServerIdentity,
    closed: AtomicBool,
    /// Mutating commands executed so far.
    pub writes: Arc<AtomicU64>,
    /// `CONFIG SET notify-keyspace-events` invocations.
    pub notify_sets: Arc<AtomicU64>,
    notify_flags: Mutex<String>,
    fail_keys: Mutex<HashSet<String>>,
    unsupported: Mutex<BTreeMap<String, String>>,
    scan_hook: Mutex<Option<ScanHook>>,
}

#[allow(dead_code)]
impl MemorySession {
    pub fn new(store: MemoryStore, run_id: &str, host: &str, port: u16) -> Self {
        Self {
            store,
            identity: ServerIdentity {
                run_id: Some(run_id.to_string()),
                host: host.to_string(),
                port,
            },
            closed: AtomicBool::new(false),
            writes: Arc::new(AtomicU64::new(0)),
            notify_sets: Arc::new(AtomicU64::new(0)),
            notify_flags: Mutex::new(String::new()),
            fail_keys: Mutex::new(HashSet::new()),
            unsupported: Mutex::new(BTreeMap::new()),
            scan_hook: Mutex::new(None),
        }
    }

    /// Every write touching `key` fails with an I/O error.
    pub fn fail_key(&self, key: &str) {
        self.fail_keys.lock().insert(key.to_string());
    }

    /// `TYPE` for `key` reports `tag` instead of the stored kind.
    pub fn mark_unsupported(&self, key: &str, tag: &str) {
        self.unsupported
            .lock()
            .insert(key.to_string(), tag.to_string());
    }

    /// Run `hook(cursor)` at the start of every scan page.
    pub fn set_scan_hook(&self, hook: impl FnMut(u64) + Send + 'static) {
        *self.scan_hook.lock() = Some(Box::new(hook));
    }

    pub fn set_notify_flags(&self, flags: &str) {
        *self.notify_flags.lock() = flags.to_string();
    }

    pub fn notify_flags(&self) -> String {
        self.notify_flags.lock().clone()
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> SessionResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> SessionResult<()> {
        self.check_open()?;
        if self.fail_keys.lock().contains(key) {
            return Err(SessionError::Io(format!("injected failure for {}", key)));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn ping(&self) -> SessionResult<()> {
        self.check_open()
    }

    async fn server_identity(&self) -> SessionResult<ServerIdentity> {
        self.check_open()?;
        Ok(self.identity.clone())
    }

    async fn dbsize(&self) -> SessionResult<u64> {
        self.check_open()?;
        Ok(self.store.len() as u64)
    }

    async fn scan(&self, cursor: u64, count: usize) -> SessionResult<(u64, Vec<String>)> {
        self.check_open()?;
        if let Some(hook) = self.scan_hook.lock().as_mut() {
            hook(cursor);
        }
        let keys = self.store.keys();
        let start = (cursor as usize).min(keys.len());
        let end = (start + count.max(1)).min(keys.len());
        let page = keys[start..end].to_vec();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn exists(&self, key: &str) -> SessionResult<bool> {
        self.check_open()?;
        Ok(self.store.contains(key))
    }

    async fn key_kind(&self, key: &str) -> SessionResult<KeyKind> {
        self.check_open()?;
        if let Some(tag) = self.unsupported.lock().get(key) {
            return Ok(KeyKind::Other(tag.clone()));
        }
        let kind = match self.store.entry(key) {
            Some(entry) => match entry.value {
                Value::Scalar(_) => KeyKind::Scalar,
                Value::Map(_) => KeyKind::Map,
                Value::Set(_) => KeyKind::UnorderedSet,
                Value::SortedSet(_) => KeyKind::OrderedSet,
                Value::List(_) => KeyKind::List,
            },
            None => KeyKind::Other("none".to_string()),
        };
        Ok(kind)
    }

    async fn ttl(&self, key: &str) -> SessionResult<i64> {
        self.check_open()?;
        Ok(self.store.entry(key).map(|e| e.ttl).unwrap_or(-2))
    }

    async fn get_scalar(&self, key: &str) -> SessionResult<Option<String>> {
        self.check_open()?;
        Ok(self.store.scalar(key))
    }

    async fn get_map(&self, key: &str) -> SessionResult<Vec<(String, String)>> {
        self.check_open()?;
        match self.store.entry(key).map(|e| e.value) {
            Some(Value::Map(fields)) => Ok(fields.into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn get_set(&self, key: &str) -> SessionResult<Vec<String>> {
        self.check_open()?;
        match self.store.entry(key).map(|e| e.value) {
            Some(Value::Set(members)) => Ok(members.into_iter().collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn get_sorted_set(&self, key: &str) -> SessionResult<Vec<(String, f64)>> {
        self.check_open()?;
        match self.store.entry(key).map(|e| e.value) {
            Some(Value::SortedSet(mut members)) => {
                members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
                Ok(members)
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn get_list(&self, key: &str) -> SessionResult<Vec<String>> {
        self.check_open()?;
        match self.store.entry(key).map(|e| e.value) {
            Some(Value::List(items)) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    async fn put_scalar(&self, key: &str, value: &str) -> SessionResult<()> {
        self.check_write(key)?;
        let ttl = self.store.entry(key).map(|e| e.ttl).unwrap_or(TTL_NONE);
        self.store
            .put_with_ttl(key, Value::Scalar(value.to_string()), ttl);
        Ok(())
    }

    async fn put_map(&self, key: &str, fields: &[(String, String)]) -> SessionResult<()> {
        self.check_write(key)?;
        let mut map = match self.store.entry(key).map(|e| e.value) {
            Some(Value::Map(existing)) => existing,
            _ => BTreeMap::new(),
        };
        for (field, value) in fields {
            map.insert(field.clone(), value.clone());
        }
        self.store.put(key, Value::Map(map));
        Ok(())
    }

    async fn add_set_members(&self, key: &str, members: &[String]) -> SessionResult<()> {
        self.check_write(key)?;
        let mut set = match self.store.entry(key).map(|e| e.value) {
            Some(Value::Set(existing)) => existing,
            _ => BTreeSet::new(),
        };
        set.extend(members.iter().cloned());
        self.store.put(key, Value::Set(set));
        Ok(())
    }

    async fn add_sorted_members(&self, key: &str, members: &[(String, f64)]) -> SessionResult<()> {
        self.check_write(key)?;
        let mut sorted = match self.store.entry(key).map(|e| e.value) {
            Some(Value::SortedSet(existing)) => existing,
            _ => Vec::new(),
        };
        for (member, score) in members {
            match sorted.iter_mut().find(|(m, _)| m == member) {
                Some(slot) => slot.1 = *score,
                None => sorted.push((member.clone(), *score)),
            }
        }
        self.store.put(key, Value::SortedSet(sorted));
        Ok(())
    }

    async fn push_list_items(&self, key: &str, items: &[String]) -> SessionResult<()> {
        self.check_write(key)?;
        let mut list = match self.store.entry(key).map(|e| e.value) {
            Some(Value::List(existing)) => existing,
            _ => Vec::new(),
        };
        list.extend(items.iter().cloned());
        self.store.put(key, Value::List(list));
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<()> {
        self.check_write(key)?;
        self.store.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: i64) -> SessionResult<()> {
        self.check_write(key)?;
        if let Some(entry) = self.store.entry(key) {
            self.store.put_with_ttl(key, entry.value, seconds);
        }
        Ok(())
    }

    async fn notify_config(&self) -> SessionResult<String> {
        self.check_open()?;
        Ok(self.notify_flags.lock().clone())
    }

    async fn set_notify_config(&self, flags: &str) -> SessionResult<()> {
        self.check_open()?;
        self.notify_sets.fetch_add(1, Ordering::SeqCst);
        *self.notify_flags.lock() = flags.to_string();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// In-memory event source
// ============================================================================

/// An [`EventSource`] whose notifications are pushed by the test itself.
#[derive(Default)]
pub struct MemoryEvents {
    tx: Mutex<Option<mpsc::Sender<KeyspaceEvent>>>,
    subscribed: AtomicBool,
}

#[allow(dead_code)]
impl MemoryEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Push a keyspace notification into the engine. Returns `false` when
    /// no subscription is active.
    pub fn emit(&self, operation: &str, key: &str) -> bool {
        let sender = self.tx.lock().clone();
        match sender {
            Some(tx) => tx
                .try_send(KeyspaceEvent {
                    key: key.to_string(),
                    operation: operation.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl EventSource for MemoryEvents {
    async fn subscribe(&self, _pattern: &str) -> SessionResult<mpsc::Receiver<KeyspaceEvent>> {
        let (tx, rx) = mpsc::channel(256);
        *self.tx.lock() = Some(tx);
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        self.tx.lock().take();
        self.subscribed.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.unsubscribe().await;
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// A full engine wired over in-memory sessions.
#[allow(dead_code)]
pub struct Fixture {
    pub source_store: MemoryStore,
    pub target_store: MemoryStore,
    pub source: Arc<MemorySession>,
    pub target: Arc<MemorySession>,
    pub events: Arc<MemoryEvents>,
    pub engine: MigrationEngine,
}

/// Engine options tightened for tests: tiny pages, fast metric cadence.
#[allow(dead_code)]
pub fn test_options() -> EngineOptions {
    EngineOptions {
        enable_realtime_sync: true,
        batch_size: 10,
        chunk_size: 4,
        metric_interval: Duration::from_millis(50),
    }
}

#[allow(dead_code)]
pub fn fixture(options: EngineOptions) -> Fixture {
    let source_store = MemoryStore::new();
    let target_store = MemoryStore::new();
    let source = Arc::new(MemorySession::new(
        source_store.clone(),
        "run-source",
        "source.test",
        6379,
    ));
    let target = Arc::new(MemorySession::new(
        target_store.clone(),
        "run-target",
        "target.test",
        6380,
    ));
    let events = Arc::new(MemoryEvents::new());
    let pair = ConnectionPair::from_parts(source.clone(), target.clone(), events.clone());
    let engine = MigrationEngine::new(pair, "test-migration", options);
    Fixture {
        source_store,
        target_store,
        source,
        target,
        events,
        engine,
    }
}

// ============================================================================
// Timing helpers
// ============================================================================

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain everything currently buffered on an event subscription.
#[allow(dead_code)]
pub fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<keyhaul::MigrationEvent>,
) -> Vec<keyhaul::MigrationEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
