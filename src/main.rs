//! limitwatch — consolidated rate-limit usage for AI coding assistants.
//!
//! Runs as a local daemon: every few seconds it gathers the credentials
//! other tools left on this machine, asks each provider how much of its
//! rate-limit windows has been used, and serves the combined view over
//! a Unix socket as JSON-RPC.
//!
//! Behavior worth knowing:
//! - Several tokens per provider are tried in order; a later token that
//!   works is promoted so it is tried first next time
//! - A provider with a single, repeatedly rejected token stops being
//!   polled until its credentials change
//! - Repeated failures are logged once, not on every tick

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

mod adapters;
mod config;
mod pool;
mod refresh;
mod server;
mod tokens;

use config::Config;
use refresh::Refresher;
use tokens::store::{CredentialPaths, FileCredentialStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (structured logs)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "limitwatch=info".into()),
        )
        .with_target(false)
        .init();

    info!("limitwatch v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    let home = dirs::home_dir().context("Cannot determine home directory")?;

    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;

    // ── Credentials ─────────────────────────────────────────────────
    let store = FileCredentialStore::new(CredentialPaths::new(&home, &config.data_dir));
    let sources = store.detected_sources();
    if sources.is_empty() {
        info!("No credentials found yet — sign in to a supported tool or use usage.connect");
    } else {
        info!(sources = %sources.join(", "), "Credential sources detected");
    }
    info!(path = %store.store_path().display(), "Token store");

    // ── Refresh ─────────────────────────────────────────────────────
    let providers = config.providers.clone();
    info!(
        providers = %providers.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "),
        interval_secs = config.refresh_interval.as_secs(),
        "Polling providers"
    );

    let refresher = Arc::new(Refresher::with_http_adapters(
        Arc::new(store),
        providers,
        config.fallback_log_window,
    ));

    // First tick runs before the socket opens so clients never see an empty view.
    let initial = refresher.refresh_all().await;
    info!(
        authenticated = initial.iter().filter(|s| s.authenticated).count(),
        total = initial.len(),
        "Initial refresh complete"
    );

    let poller = Arc::clone(&refresher);
    let interval = config.refresh_interval;
    tokio::spawn(async move {
        refresh::poller::run_poller(poller, interval).await;
    });

    // ── JSON-RPC Server ─────────────────────────────────────────────
    let srv = server::Server::new(config.socket_path, refresher);
    srv.run().await?;

    Ok(())
}
