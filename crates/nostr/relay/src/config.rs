//! Relay configuration loading from file and environment variables.

use crate::db::DatabaseConfig;
use crate::retention::RetentionRule;
use nostr::is_lower_hex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Protocol limits.
    #[serde(default)]
    pub limits: Limits,

    /// Per-pubkey retention rules, applied after each write.
    #[serde(default)]
    pub retention: Vec<RetentionRule>,

    /// Pubkeys never subject to retention.
    #[serde(default)]
    pub exemptions: ExemptionsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Largest accepted text frame, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Public URL of this relay. AUTH events must name it when set.
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Frames buffered per connection before live deliveries are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Seconds between sweeps of expired events.
    #[serde(default = "default_expiry_sweep_interval")]
    pub expiry_sweep_interval_secs: u64,
}

/// Limits enforced on client messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_subscriptions: usize,
    pub max_filters: usize,
    pub max_subid_length: usize,
    /// Upper bound for the effective limit of a subscription.
    pub max_limit: usize,
    /// Limit applied when no filter of a subscription specifies one.
    pub default_limit: usize,
    /// Shortest accepted id/author prefix. Zero disables the check.
    pub min_prefix_length: usize,
    pub max_ids: usize,
    pub max_authors: usize,
    pub max_kinds: usize,
    pub max_tag_keys: usize,
    pub max_tag_values: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,
    /// Required leading zero bits in event ids. Zero disables the check.
    pub min_pow_difficulty: u32,
    /// Offset from now, in seconds, of the oldest accepted `created_at`.
    pub created_at_lower: i64,
    /// Offset from now, in seconds, of the newest accepted `created_at`.
    pub created_at_upper: i64,
    /// Require NIP-42 authentication before accepting events.
    pub auth_required: bool,
}

/// Pubkeys exempt from retention pruning.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExemptionsConfig {
    pub operator_pubkey: Option<String>,
    pub admin_pubkeys: Vec<String>,
    pub whitelist: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "nostr_relay=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7000))
}

fn default_max_message_size() -> usize {
    393_216
}

fn default_outbox_capacity() -> usize {
    1024
}

fn default_expiry_sweep_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_message_size: default_max_message_size(),
            relay_url: None,
            outbox_capacity: default_outbox_capacity(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_subscriptions: 32,
            max_filters: 10,
            max_subid_length: 64,
            max_limit: 5000,
            default_limit: 500,
            min_prefix_length: 0,
            max_ids: 100,
            max_authors: 100,
            max_kinds: 100,
            max_tag_keys: 10,
            max_tag_values: 100,
            max_event_tags: 2048,
            max_content_length: 102_400,
            min_pow_difficulty: 0,
            created_at_lower: -86_400,
            created_at_upper: 300,
            auth_required: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `NOSTR_RELAY_BIND` overrides `server.bind_addr`
/// - `NOSTR_RELAY_URL` overrides `server.relay_url`
/// - `NOSTR_RELAY_DB_PATH` overrides `database.path`
/// - `NOSTR_RELAY_AUTH_REQUIRED` overrides `limits.auth_required`
/// - `NOSTR_RELAY_MIN_POW` overrides `limits.min_pow_difficulty`
/// - `NOSTR_RELAY_CREATED_AT_RANGE` overrides the `created_at` window (`"-86400~300"`)
/// - `NOSTR_RELAY_RETENTION` replaces `retention` (JSON array of rules)
/// - `NOSTR_RELAY_WHITELIST` replaces `exemptions.whitelist` (comma separated)
/// - `NOSTR_RELAY_LOG_LEVEL` overrides `logging.level`
/// - `NOSTR_RELAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// Whitelist entries that are not 64 lowercase hex characters are dropped.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if an override holds an unparseable value.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %p.display(), "config file not found, using defaults");
                RelayConfig::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => RelayConfig::default(),
    };

    let mut config = apply_env_overrides(config, |var| std::env::var(var).ok())?;
    config.exemptions.whitelist = sanitize_pubkeys(config.exemptions.whitelist);
    Ok(config)
}

/// Apply `NOSTR_RELAY_*` overrides read through `lookup`.
pub fn apply_env_overrides(
    mut config: RelayConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RelayConfig, ConfigError> {
    if let Some(bind) = lookup("NOSTR_RELAY_BIND") {
        config.server.bind_addr = bind.parse().map_err(|e: std::net::AddrParseError| {
            ConfigError::Env {
                var: "NOSTR_RELAY_BIND",
                reason: e.to_string(),
            }
        })?;
    }
    if let Some(url) = lookup("NOSTR_RELAY_URL") {
        config.server.relay_url = Some(url);
    }
    if let Some(db_path) = lookup("NOSTR_RELAY_DB_PATH") {
        config.database.path = PathBuf::from(db_path);
    }
    if let Some(auth) = lookup("NOSTR_RELAY_AUTH_REQUIRED") {
        config.limits.auth_required = auth == "true" || auth == "1";
    }
    if let Some(pow) = lookup("NOSTR_RELAY_MIN_POW") {
        config.limits.min_pow_difficulty =
            pow.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Env {
                var: "NOSTR_RELAY_MIN_POW",
                reason: e.to_string(),
            })?;
    }
    if let Some(range) = lookup("NOSTR_RELAY_CREATED_AT_RANGE") {
        let (lower, upper) = parse_time_range(&range).ok_or_else(|| ConfigError::Env {
            var: "NOSTR_RELAY_CREATED_AT_RANGE",
            reason: format!("expected \"lower~upper\", got {:?}", range),
        })?;
        config.limits.created_at_lower = lower;
        config.limits.created_at_upper = upper;
    }
    if let Some(rules) = lookup("NOSTR_RELAY_RETENTION") {
        config.retention =
            serde_json::from_str(&rules).map_err(|e| ConfigError::Env {
                var: "NOSTR_RELAY_RETENTION",
                reason: e.to_string(),
            })?;
    }
    if let Some(list) = lookup("NOSTR_RELAY_WHITELIST") {
        config.exemptions.whitelist = list.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(level) = lookup("NOSTR_RELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("NOSTR_RELAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

fn parse_time_range(range: &str) -> Option<(i64, i64)> {
    let (lower, upper) = range.split_once('~')?;
    let lower = lower.trim().parse().ok()?;
    let upper = upper.trim().parse().ok()?;
    (lower <= upper).then_some((lower, upper))
}

fn sanitize_pubkeys(pubkeys: Vec<String>) -> Vec<String> {
    pubkeys
        .into_iter()
        .filter(|pk| {
            let ok = is_lower_hex(pk, 64);
            if !ok && !pk.is_empty() {
                tracing::warn!(pubkey = %pk, "ignoring malformed whitelist entry");
            }
            ok
        })
        .collect()
}
