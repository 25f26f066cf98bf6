//! Live session implementations over the RESP driver.
//!
//! [`RedisSession`] wraps a multiplexed async connection; every trait method
//! is one command, no retries. [`RedisEventSource`] owns the dedicated
//! pub/sub connection and pumps decoded keyspace notifications into a
//! channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::{EventSource, KeyKind, KeyspaceEvent, ServerIdentity, Session};

/// Capacity of the keyspace notification channel between the pub/sub pump
/// and the subscriber task.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Extract the key from a keyspace notification channel name of the form
/// `__keyspace@<db>__:<key>`. Keys may themselves contain `:`.
fn parse_keyspace_channel(channel: &str) -> Option<&str> {
    channel.split_once("__:").map(|(_, key)| key)
}

fn parse_run_id(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("run_id:").map(|v| v.trim().to_string()))
}

// ---------------------------------------------------------------------------
// Request/response session
// ---------------------------------------------------------------------------

/// A request/response session over one multiplexed connection.
pub struct RedisSession {
    conn: redis::aio::MultiplexedConnection,
    host: String,
    port: u16,
    closed: AtomicBool,
}

impl RedisSession {
    /// Connect and authenticate against the endpoint.
    pub async fn connect(cfg: &EndpointConfig) -> SessionResult<Self> {
        debug!(host = %cfg.host, port = cfg.port, tls = cfg.tls, "opening session");
        let client = redis::Client::open(cfg.url().as_str())
            .map_err(|e| SessionError::Protocol(format!("invalid endpoint: {}", e)))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            host: cfg.host.clone(),
            port: cfg.port,
            closed: AtomicBool::new(false),
        })
    }

    /// Clone the connection handle for one command, refusing when closed.
    fn command_conn(&self) -> SessionResult<redis::aio::MultiplexedConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(self.conn.clone())
    }
}

#[async_trait]
impl Session for RedisSession {
    async fn ping(&self) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn server_identity(&self) -> SessionResult<ServerIdentity> {
        let mut conn = self.command_conn()?;
        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut conn)
            .await?;
        Ok(ServerIdentity {
            run_id: parse_run_id(&info),
            host: self.host.clone(),
            port: self.port,
        })
    }

    async fn dbsize(&self) -> SessionResult<u64> {
        let mut conn = self.command_conn()?;
        let size: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(size)
    }

    async fn scan(&self, cursor: u64, count: usize) -> SessionResult<(u64, Vec<String>)> {
        let mut conn = self.command_conn()?;
        let reply: (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn exists(&self, key: &str) -> SessionResult<bool> {
        let mut conn = self.command_conn()?;
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn key_kind(&self, key: &str) -> SessionResult<KeyKind> {
        let mut conn = self.command_conn()?;
        let reply: String = redis::cmd("TYPE").arg(key).query_async(&mut conn).await?;
        Ok(KeyKind::from_type_reply(&reply))
    }

    async fn ttl(&self, key: &str) -> SessionResult<i64> {
        let mut conn = self.command_conn()?;
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    async fn get_scalar(&self, key: &str) -> SessionResult<Option<String>> {
        let mut conn = self.command_conn()?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_map(&self, key: &str) -> SessionResult<Vec<(String, String)>> {
        let mut conn = self.command_conn()?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(fields.into_iter().collect())
    }

    async fn get_set(&self, key: &str) -> SessionResult<Vec<String>> {
        let mut conn = self.command_conn()?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn get_sorted_set(&self, key: &str) -> SessionResult<Vec<(String, f64)>> {
        let mut conn = self.command_conn()?;
        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn get_list(&self, key: &str) -> SessionResult<Vec<String>> {
        let mut conn = self.command_conn()?;
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn put_scalar(&self, key: &str, value: &str) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn put_map(&self, key: &str, fields: &[(String, String)]) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_set_members(&self, key: &str, members: &[String]) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key);
        for member in members {
            cmd.arg(member);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_sorted_members(&self, key: &str, members: &[(String, f64)]) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (member, score) in members {
            cmd.arg(*score).arg(member);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn push_list_items(&self, key: &str, items: &[String]) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key);
        for item in items {
            cmd.arg(item);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: i64) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn notify_config(&self) -> SessionResult<String> {
        let mut conn = self.command_conn()?;
        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("notify-keyspace-events")
            .query_async(&mut conn)
            .await?;
        Ok(reply.into_iter().nth(1).unwrap_or_default())
    }

    async fn set_notify_config(&self, flags: &str) -> SessionResult<()> {
        let mut conn = self.command_conn()?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(flags)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        debug!(host = %self.host, port = self.port, "session closed");
    }
}

// ---------------------------------------------------------------------------
// Pub/sub session
// ---------------------------------------------------------------------------

/// The dedicated pub/sub connection to the source.
///
/// The underlying protocol multiplexes pub/sub poorly with request/response
/// traffic, so this is a separate connection from the same endpoint config.
/// The connection is only opened on [`EventSource::subscribe`].
pub struct RedisEventSource {
    client: redis::Client,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisEventSource {
    /// Prepare a pub/sub session for the endpoint. No I/O happens until
    /// the subscription is opened.
    pub fn new(cfg: &EndpointConfig) -> SessionResult<Self> {
        let client = redis::Client::open(cfg.url().as_str())
            .map_err(|e| SessionError::Protocol(format!("invalid endpoint: {}", e)))?;
        Ok(Self {
            client,
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EventSource for RedisEventSource {
    async fn subscribe(&self, pattern: &str) -> SessionResult<mpsc::Receiver<KeyspaceEvent>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        debug!(pattern, "keyspace subscription established");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let operation: String = match msg.get_payload() {
                    Ok(op) => op,
                    Err(err) => {
                        warn!(%err, "undecodable keyspace notification payload");
                        continue;
                    }
                };
                let key = match parse_keyspace_channel(msg.get_channel_name()) {
                    Some(key) => key.to_string(),
                    None => continue,
                };
                if tx.send(KeyspaceEvent { key, operation }).await.is_err() {
                    break;
                }
            }
            debug!("keyspace notification stream ended");
        });
        *self.pump.lock() = Some(handle);
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.unsubscribe().await;
    }
}
