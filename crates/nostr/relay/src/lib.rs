//! Nostr relay engine
//!
//! This crate provides the protocol side of a Nostr relay:
//! - Event validation (structure, time window, proof of work, delegation, signature)
//! - Filter matching and compilation into parameterized SQL
//! - SQLite storage with connection pooling, replaceable identities,
//!   soft deletion and expiry
//! - Per-pubkey retention rules with an exemption list
//! - Per-connection protocol state and live fan-out across instances
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     WebSocket Server (tokio-tungstenite)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │         Connection                          │
//! │   EVENT / REQ / CLOSE / AUTH, outbox        │
//! └──────┬─────────────────┬────────────────────┘
//!        │                 │
//! ┌──────▼───────┐  ┌──────▼──────────────────┐
//! │  Validation  │  │  Subscription Registry  │◄── Broadcast Bus
//! │  + Compiler  │  │  (live fan-out)         │
//! └──────┬───────┘  └─────────────────────────┘
//!        │
//! ┌──────▼──────────────────────────────────────┐
//! │  EventStore (SQLite) ── RetentionPolicy     │
//! │  Writer Pool │ Reader Pool │ Meta Pool      │
//! └─────────────────────────────────────────────┘
//! ```

mod broadcast;
mod config;
mod connection;
mod db;
mod error;
mod hooks;
mod message;
mod metrics;
mod query;
mod registry;
mod retention;
mod server;
mod storage;
mod subscription;
mod validation;

#[cfg(test)]
mod tests;

pub use broadcast::{BROADCAST_CAPACITY, BroadcastEvent, EventBus, LocalBus, SEEN_CAPACITY, SeenEvents};
pub use config::{
    ConfigError, ExemptionsConfig, Limits, LoggingConfig, RelayConfig, ServerConfig,
    apply_env_overrides, load_config,
};
pub use connection::{Connection, ConnectionState, RelayContext, generate_auth_challenge};
pub use db::{ConnectionPool, Database, DatabaseConfig};
pub use error::{RelayError, Result};
pub use hooks::{Hooks, IdentityHook, PaymentHook, SpamFilter, WordListSpamFilter};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use metrics::{MetricsSnapshot, Rejection, RelayMetrics};
pub use query::{CompiledFilter, CompiledQuery, FilterError, HexMatch, QueryCompiler, QueryLimits};
pub use registry::{ConnectionId, FanOut, SubscriptionRegistry};
pub use retention::{ExemptionList, KindOrRange, RetentionPolicy, RetentionRule};
pub use server::{RelayServer, spawn_bus_listener, spawn_expiry_sweep};
pub use storage::{EventStore, StorageError, StorageResult, StoreStatistics, WriteOutcome};
pub use subscription::{Filter, Subscription, SubscriptionManager, matches_any};
pub use validation::{
    EventRecord, TimeWindow, ValidationError, ValidationPolicy, check_id_and_signature,
    check_structure, check_time_window, validate,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
