//! Client session abstractions shared by the engine.
//!
//! The engine talks to the source and target through the [`Session`] trait
//! and receives keyspace notifications through [`EventSource`]. The live
//! implementations over the RESP driver live in [`crate::client`]; tests
//! substitute in-memory fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{RedisEventSource, RedisSession};
use crate::config::EndpointConfig;
use crate::error::{MigrationError, Result, SessionResult};

/// TTL reply meaning "no expiry set".
pub const TTL_NONE: i64 = -1;
/// TTL reply meaning "key does not exist".
pub const TTL_MISSING: i64 = -2;

/// Data-type tag of a key, built from the server's `TYPE` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// A single string value.
    Scalar,
    /// A field-to-value map.
    Map,
    /// An unordered member set.
    UnorderedSet,
    /// A score-ordered member set.
    OrderedSet,
    /// An ordered list of items.
    List,
    /// Anything else; carries the server's literal type tag.
    Other(String),
}

impl KeyKind {
    /// Build a kind from the wire-level `TYPE` reply.
    pub fn from_type_reply(reply: &str) -> Self {
        match reply {
            "string" => KeyKind::Scalar,
            "hash" => KeyKind::Map,
            "set" => KeyKind::UnorderedSet,
            "zset" => KeyKind::OrderedSet,
            "list" => KeyKind::List,
            other => KeyKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::Scalar => write!(f, "scalar"),
            KeyKind::Map => write!(f, "map"),
            KeyKind::UnorderedSet => write!(f, "set"),
            KeyKind::OrderedSet => write!(f, "sorted-set"),
            KeyKind::List => write!(f, "list"),
            KeyKind::Other(tag) => write!(f, "{}", tag),
        }
    }
}

/// Identity of a server instance, used to refuse migrating a server into
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// The server's run id from `INFO server`, when it reports one.
    pub run_id: Option<String>,
    /// Configured host of the endpoint.
    pub host: String,
    /// Configured port of the endpoint.
    pub port: u16,
}

impl ServerIdentity {
    /// Whether both identities point at the same server. Compares run ids
    /// when both sides report one, falling back to address equality.
    pub fn same_instance(&self, other: &ServerIdentity) -> bool {
        match (&self.run_id, &other.run_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.host == other.host && self.port == other.port,
        }
    }
}

/// A keyspace notification received from the source.
#[derive(Debug, Clone)]
pub struct KeyspaceEvent {
    /// The affected key.
    pub key: String,
    /// The operation name (set, del, expire, lpush, ...).
    pub operation: String,
}

/// One request/response client session.
///
/// Every method is a single command with no automatic retry; connection
/// loss surfaces to the caller. Implementations serialize commands per
/// connection, so a session may be shared across engine tasks.
#[async_trait]
pub trait Session: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> SessionResult<()>;
    /// Identity of the server behind this session.
    async fn server_identity(&self) -> SessionResult<ServerIdentity>;
    /// Number of keys in the selected database.
    async fn dbsize(&self) -> SessionResult<u64>;
    /// One page of the cursor-driven keyspace sweep. Returns
    /// `(next_cursor, keys)`; a next cursor of `0` ends the sweep.
    async fn scan(&self, cursor: u64, count: usize) -> SessionResult<(u64, Vec<String>)>;
    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> SessionResult<bool>;
    /// Data-type tag of `key`.
    async fn key_kind(&self, key: &str) -> SessionResult<KeyKind>;
    /// Remaining TTL of `key` in seconds; [`TTL_NONE`] or [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> SessionResult<i64>;

    /// Read a scalar value.
    async fn get_scalar(&self, key: &str) -> SessionResult<Option<String>>;
    /// Read all field/value pairs of a map.
    async fn get_map(&self, key: &str) -> SessionResult<Vec<(String, String)>>;
    /// Read all members of an unordered set.
    async fn get_set(&self, key: &str) -> SessionResult<Vec<String>>;
    /// Read all members of a score-ordered set, ascending by score.
    async fn get_sorted_set(&self, key: &str) -> SessionResult<Vec<(String, f64)>>;
    /// Read all items of a list, left to right.
    async fn get_list(&self, key: &str) -> SessionResult<Vec<String>>;

    /// Write a scalar value.
    async fn put_scalar(&self, key: &str, value: &str) -> SessionResult<()>;
    /// Write field/value pairs into a map.
    async fn put_map(&self, key: &str, fields: &[(String, String)]) -> SessionResult<()>;
    /// Add members to an unordered set.
    async fn add_set_members(&self, key: &str, members: &[String]) -> SessionResult<()>;
    /// Add (member, score) pairs to a score-ordered set.
    async fn add_sorted_members(&self, key: &str, members: &[(String, f64)]) -> SessionResult<()>;
    /// Append items to the right end of a list.
    async fn push_list_items(&self, key: &str, items: &[String]) -> SessionResult<()>;
    /// Delete a key.
    async fn delete(&self, key: &str) -> SessionResult<()>;
    /// Set the expiry of `key` to `seconds` from now.
    async fn expire(&self, key: &str, seconds: i64) -> SessionResult<()>;

    /// Current `notify-keyspace-events` flag string.
    async fn notify_config(&self) -> SessionResult<String>;
    /// Overwrite the `notify-keyspace-events` flag string.
    async fn set_notify_config(&self, flags: &str) -> SessionResult<()>;

    /// Close the session. Idempotent; later commands fail with
    /// [`crate::error::SessionError::Closed`].
    async fn close(&self);
}

/// The dedicated pub/sub session on the source.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Subscribe to keyspace notifications matching `pattern` and return
    /// the receiving end of the event channel. At most one subscription is
    /// active per source.
    async fn subscribe(&self, pattern: &str) -> SessionResult<mpsc::Receiver<KeyspaceEvent>>;
    /// Tear down the active subscription, if any. Idempotent.
    async fn unsubscribe(&self);
    /// Close the session. Idempotent.
    async fn close(&self);
}

/// The three sessions a migration runs on: request/response to source and
/// target, plus a pub/sub session duplicated from the source endpoint.
///
/// The engine exclusively owns all three; they are closed together by
/// [`ConnectionPair::close`].
pub struct ConnectionPair {
    pub(crate) source: Arc<dyn Session>,
    pub(crate) target: Arc<dyn Session>,
    pub(crate) events: Arc<dyn EventSource>,
}

impl ConnectionPair {
    /// Open all three sessions. A failure on any of them closes whatever
    /// was already opened.
    pub async fn connect(
        source_cfg: &EndpointConfig,
        target_cfg: &EndpointConfig,
    ) -> SessionResult<Self> {
        let source = RedisSession::connect(source_cfg).await?;
        let target = match RedisSession::connect(target_cfg).await {
            Ok(target) => target,
            Err(err) => {
                source.close().await;
                return Err(err);
            }
        };
        let events = match RedisEventSource::new(source_cfg) {
            Ok(events) => events,
            Err(err) => {
                source.close().await;
                target.close().await;
                return Err(err);
            }
        };
        Ok(Self {
            source: Arc::new(source),
            target: Arc::new(target),
            events: Arc::new(events),
        })
    }

    /// Assemble a pair from existing sessions.
    pub fn from_parts(
        source: Arc<dyn Session>,
        target: Arc<dyn Session>,
        events: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            source,
            target,
            events,
        }
    }

    /// The source session.
    pub fn source(&self) -> &Arc<dyn Session> {
        &self.source
    }

    /// The target session.
    pub fn target(&self) -> &Arc<dyn Session> {
        &self.target
    }

    /// The pub/sub session.
    pub fn events(&self) -> &Arc<dyn EventSource> {
        &self.events
    }

    /// Pre-flight check: both sides answer a liveness probe and do not
    /// resolve to the same server. Any failure closes all sessions.
    pub async fn validate(&self) -> Result<()> {
        let outcome = self.validate_inner().await;
        if outcome.is_err() {
            self.close().await;
        }
        outcome
    }

    async fn validate_inner(&self) -> Result<()> {
        self.source.ping().await?;
        self.target.ping().await?;

        let source_id = self.source.server_identity().await?;
        let target_id = self.target.server_identity().await?;
        debug!(source = ?source_id, target = ?target_id, "validated endpoints");
        if source_id.same_instance(&target_id) {
            return Err(MigrationError::SameInstance);
        }
        Ok(())
    }

    /// Close all three sessions. Idempotent; tolerates sessions that never
    /// opened.
    pub async fn close(&self) {
        self.events.close().await;
        self.source.close().await;
        self.target.close().await;
    }
}
