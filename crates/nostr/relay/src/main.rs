//! Nostr relay binary
//!
//! Usage: `nostr-relay [config.toml]`. The config path may also come from
//! `NOSTR_RELAY_CONFIG`. Missing files fall back to defaults.

use anyhow::Context;
use nostr_relay::{Database, LoggingConfig, RelayContext, RelayServer, load_config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NOSTR_RELAY_CONFIG").ok())
        .map(PathBuf::from);

    let config = load_config(config_path.as_deref()).context("loading relay configuration")?;
    init_tracing(&config.logging);

    info!(
        bind = %config.server.bind_addr,
        database = %config.database.path.display(),
        retention_rules = config.retention.len(),
        "starting nostr relay"
    );

    let db = Database::new(config.database.clone()).context("opening event database")?;
    let ctx = RelayContext::new(&config, Arc::new(db));
    let server = RelayServer::new(Arc::new(ctx));

    server.start().await.context("relay server stopped")?;
    Ok(())
}
