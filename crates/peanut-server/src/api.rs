use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use peanut_shared::tokens::TokenManager;
use peanut_store::Database;
use tokio::sync::Mutex;

use crate::audit::{self, AuditChain};
use crate::auth;
use crate::backend::BackendClient;
use crate::config::GatewayConfig;
use crate::orchestrator::{self, AgentOrchestrator};
use crate::rate_limit::RateLimiter;
use crate::vault::{self, VaultService};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub config: Arc<GatewayConfig>,
    pub tokens: TokenManager,
    pub audit: AuditChain,
    pub limiter: RateLimiter,
    pub orchestrator: Arc<AgentOrchestrator>,
    pub vault: VaultService,
    pub started_at: Instant,
}

/// Wire the services together around one database handle.
pub fn build_state(config: GatewayConfig, db: Database) -> Result<AppState, reqwest::Error> {
    let db = Arc::new(Mutex::new(db));
    let tokens = TokenManager::new(config.session_secret.as_bytes());
    let audit = AuditChain::new(db.clone());
    let limiter = RateLimiter::new(db.clone());
    let orchestrator = Arc::new(AgentOrchestrator::new(
        db.clone(),
        BackendClient::new()?,
        audit.clone(),
    ));
    let vault = VaultService::new(db.clone(), config.vault_key)?;

    Ok(AppState {
        db,
        config: Arc::new(config),
        tokens,
        audit,
        limiter,
        orchestrator,
        vault,
        started_at: Instant::now(),
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_allows_any() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([CONTENT_TYPE])
            .allow_credentials(true)
    };

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/auth/login", post(auth::login))
        .route("/auth/totp/verify", post(auth::totp_verify))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/auth/totp/setup", post(auth::totp_setup))
        .route("/auth/password", post(auth::change_password))
        .route(
            "/agents",
            get(orchestrator::list_agents).post(orchestrator::create_agent),
        )
        .route(
            "/agents/{id}",
            put(orchestrator::update_agent).delete(orchestrator::delete_agent),
        )
        .route("/agents/{id}/health", get(orchestrator::agent_health))
        .route("/openclaw/dispatch", post(orchestrator::dispatch))
        .route("/openclaw/sessions", get(orchestrator::list_dispatch_sessions))
        .route("/audit", get(audit::query_audit))
        .route("/vault/status", get(vault::vault_status))
        .route(
            "/vault/config",
            get(vault::get_vault_config).put(vault::put_vault_config),
        )
        .route("/vault/complete", post(vault::vault_complete))
        .route("/vault/usage", get(vault::vault_usage));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    let config = GatewayConfig {
        session_secret: "test-session-secret-at-least-32-bytes!".into(),
        vault_key: peanut_shared::crypto::vault_key_from_hex(&"cd".repeat(32)),
        ..GatewayConfig::default()
    };
    let db = Database::open_in_memory().expect("in-memory db");
    build_state(config, db).expect("state")
}
