mod api;
mod audit;
mod auth;
mod backend;
mod config;
mod error;
mod orchestrator;
mod rate_limit;
mod session;
mod vault;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use peanut_store::Database;

use crate::config::GatewayConfig;

/// Interval between background health sweeps.
const HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_default();
    tracing_subscriber::fmt()
        .with_env_filter(if log_level.is_empty() {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peanut_server=debug"))
        } else {
            EnvFilter::new(log_level)
        })
        .init();

    info!(
        "Starting Peanut Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = GatewayConfig::from_env();
    info!(
        addr = %config.http_addr,
        data_dir = %config.data_dir.display(),
        production = config.production,
        "Loaded configuration"
    );

    let db = Database::open_at(&config.data_dir.join("peanut.db"))?;

    let http_addr = config.http_addr;
    let admin_password = config.default_admin_password.clone();
    let state = api::build_state(config, db)?;

    if auth::seed_admin(&state, &admin_password)
        .await
        .map_err(|e| anyhow::anyhow!("admin seed failed: {e}"))?
    {
        info!(email = auth::SEED_ADMIN_EMAIL, "created initial admin account");
    }

    // Health sweep every 30 s; the first pass runs immediately so freshly
    // restarted gateways get agent health before the first dispatch.
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            orchestrator.sweep().await;
        }
    });

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
