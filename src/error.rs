//! Error types for the migration engine.
//!
//! Two layers: [`SessionError`] covers the connection taxonomy of a single
//! client session, [`MigrationError`] covers engine-level and per-key
//! failures. Per-key errors are recorded and skipped; session and
//! configuration errors are fatal for the run.

use thiserror::Error;

/// Errors raised by a client session against the source or target store.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server actively refused the connection.
    #[error("connection refused: {0}")]
    ConnRefused(String),
    /// Authentication was rejected by the server.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// The operation did not complete in time.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The hostname could not be resolved.
    #[error("host not found: {0}")]
    HostNotFound(String),
    /// The peer dropped the connection mid-request.
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    /// The session was closed locally; no further commands are accepted.
    #[error("session closed")]
    Closed,
    /// A command returned a reply the engine could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::AuthenticationFailed {
            return SessionError::AuthFailed(err.to_string());
        }
        if err.is_connection_refusal() {
            return SessionError::ConnRefused(err.to_string());
        }
        if err.is_timeout() {
            return SessionError::Timeout(err.to_string());
        }

        let text = err.to_string();
        let lower = text.to_lowercase();
        if lower.contains("reset") {
            SessionError::ConnectionReset(text)
        } else if lower.contains("lookup") || lower.contains("not known") {
            SessionError::HostNotFound(text)
        } else if err.is_io_error() {
            SessionError::Io(text)
        } else {
            SessionError::Protocol(text)
        }
    }
}

/// Result alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// The primary error type returned by engine operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A session-level failure. Fatal for the current run.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Source and target resolve to the same server instance.
    #[error("source and target resolve to the same server instance")]
    SameInstance,

    /// `start` was called while a migration is active.
    #[error("a migration is already running")]
    AlreadyRunning,

    /// The replicator met a key of a kind it does not carry over.
    #[error("unsupported key type `{kind}` for key `{key}`")]
    UnsupportedType { key: String, kind: String },

    /// A single key failed to replicate. The run continues without it.
    #[error("replication failed for key `{key}`: {source}")]
    KeyReplication {
        key: String,
        #[source]
        source: Box<MigrationError>,
    },

    /// The change subscriber could not be established or broke down.
    #[error("subscriber error: {0}")]
    Subscriber(String),

    /// Keyspace notifications could not be enabled on the source.
    #[error("keyspace notifications could not be enabled: {0}")]
    Configuration(String),
}

impl MigrationError {
    /// Whether this error ends the migration run. Per-key failures are
    /// recorded and skipped; everything touching the sessions or the source
    /// configuration is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrationError::Session(_)
                | MigrationError::SameInstance
                | MigrationError::Subscriber(_)
                | MigrationError::Configuration(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigrationError>;
