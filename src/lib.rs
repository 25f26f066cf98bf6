//! Live, online migration of one key-value store into another.
//!
//! The engine bulk-copies the source keyspace while a change subscriber
//! re-covers every write that lands mid-sweep, then keeps converging the
//! target until stopped:
//!
//! 1. Validate both endpoints (liveness, auth, distinct instances)
//! 2. Subscribe to the source's keyspace notifications
//! 3. Sweep the keyspace with a cursor-driven scan, replicating each key
//!    by type (scalar, map, set, sorted set, list) with its TTL
//! 4. Coalesce change events per key and drain them through the same
//!    replicator
//! 5. Emit progress, per-key, and periodic metric events for an external
//!    control plane
//!
//! # Usage
//!
//! ```ignore
//! use keyhaul::{EndpointConfig, EngineOptions, MigrationEngine};
//!
//! let engine = MigrationEngine::connect(
//!     &EndpointConfig::new("source.internal", 6379),
//!     &EndpointConfig::new("target.internal", 6380),
//!     "mig-2024-001",
//!     EngineOptions::default(),
//! )
//! .await?;
//!
//! let mut events = engine.subscribe_events();
//! engine.start().await?; // returns at steady state
//! // ... watch events, then:
//! engine.stop().await;
//! ```
//!
//! The engine offers eventual convergence, not point-in-time consistency:
//! it assumes the source's write rate stays below replication throughput
//! long enough for the pending set to drain.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod queue;
pub mod replicator;
pub mod scanner;
pub mod session;
pub mod stats;
pub mod subscriber;

pub use config::{EndpointConfig, EngineOptions};
pub use engine::MigrationEngine;
pub use error::{MigrationError, Result, SessionError, SessionResult};
pub use events::{EventBus, KeyOperation, MigrationEvent};
pub use lifecycle::LifecycleState;
pub use replicator::Replicator;
pub use session::{
    ConnectionPair, EventSource, KeyKind, KeyspaceEvent, ServerIdentity, Session, TTL_MISSING,
    TTL_NONE,
};
pub use stats::{MigrationStatus, StatsSnapshot, StatsTracker};
