//! Agent registry, health tracking and weighted dispatch.
//!
//! Selection uses the smooth weighted round-robin algorithm over an
//! in-process cache of online agents. The cache is reloaded when older than
//! 30 seconds and invalidated immediately by any registry mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use peanut_shared::crypto::random_id;
use peanut_store::{Agent, AgentHealth, AgentType, AgentUpdate, Database, DispatchSession};

use crate::api::AppState;
use crate::audit::{AuditActor, AuditChain};
use crate::backend::{build_messages, BackendClient, ChatMessage};
use crate::error::ApiError;
use crate::rate_limit::{ClientIp, DISPATCH_POLICY};
use crate::session::CurrentUser;

/// Reload the selection cache when it is older than this.
const SELECTOR_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f64 {
    0.7
}
fn default_priority() -> u32 {
    5
}
fn default_weight() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct AgentWithHealth {
    #[serde(flatten)]
    pub agent: Agent,
    pub health: AgentHealth,
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub context: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub request_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub message: String,
    pub model: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

struct WeightedAgent {
    agent: Agent,
    current_weight: i64,
}

#[derive(Default)]
struct SelectorCache {
    entries: Vec<WeightedAgent>,
    refreshed_at: Option<Instant>,
}

impl SelectorCache {
    fn is_stale(&self) -> bool {
        self.refreshed_at
            .map_or(true, |at| at.elapsed() > SELECTOR_CACHE_TTL)
    }

    fn invalidate(&mut self) {
        self.refreshed_at = None;
    }

    /// Replace the candidate set, carrying accumulated weights over for
    /// agents that survive the reload so the interleaving stays smooth.
    fn reload(&mut self, agents: Vec<Agent>) {
        let carried: HashMap<String, i64> = self
            .entries
            .iter()
            .map(|e| (e.agent.id.clone(), e.current_weight))
            .collect();

        self.entries = agents
            .into_iter()
            .map(|agent| WeightedAgent {
                current_weight: carried.get(&agent.id).copied().unwrap_or(0),
                agent,
            })
            .collect();
        self.refreshed_at = Some(Instant::now());
    }

    /// Smooth weighted round-robin: raise every accumulator by its weight,
    /// take the largest (first seen wins ties), then charge it the total.
    fn pick(&mut self) -> Option<Agent> {
        if self.entries.is_empty() {
            return None;
        }

        let total: i64 = self.entries.iter().map(|e| i64::from(e.agent.weight)).sum();

        for entry in self.entries.iter_mut() {
            entry.current_weight += i64::from(entry.agent.weight);
        }

        let mut best = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.current_weight > self.entries[best].current_weight {
                best = i;
            }
        }

        self.entries[best].current_weight -= total;
        Some(self.entries[best].agent.clone())
    }
}

#[derive(Clone)]
pub struct AgentOrchestrator {
    db: Arc<Mutex<Database>>,
    backend: BackendClient,
    audit: AuditChain,
    cache: Arc<Mutex<SelectorCache>>,
}

impl AgentOrchestrator {
    pub fn new(db: Arc<Mutex<Database>>, backend: BackendClient, audit: AuditChain) -> Self {
        Self {
            db,
            backend,
            audit,
            cache: Arc::new(Mutex::new(SelectorCache::default())),
        }
    }

    fn validate_endpoint(endpoint: &str) -> Result<(), ApiError> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| ApiError::Validation(format!("invalid endpoint URL: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ApiError::Validation(
                "endpoint must be an http or https URL".into(),
            ));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        request: CreateAgentRequest,
        actor: &AuditActor,
    ) -> Result<AgentWithHealth, ApiError> {
        Self::validate_endpoint(&request.endpoint)?;

        let now = Utc::now();
        let agent = Agent {
            id: random_id(),
            name: request.name,
            agent_type: request.agent_type,
            endpoint: request.endpoint,
            model: request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            priority: request.priority,
            weight: request.weight,
            tags: request.tags,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        agent.validate().map_err(ApiError::Validation)?;

        let health = AgentHealth::initial(agent.id.clone(), now);
        {
            let mut db = self.db.lock().await;
            db.create_agent(&agent, &health)?;
        }
        self.invalidate_cache().await;

        self.audit
            .append(
                "agent.created",
                actor,
                Some("agent"),
                Some(&agent.id),
                details(&[("name", &agent.name), ("type", agent.agent_type.as_str())]),
            )
            .await?;

        tracing::info!(id = %agent.id, name = %agent.name, "agent registered");
        Ok(AgentWithHealth { agent, health })
    }

    pub async fn update(
        &self,
        id: &str,
        update: AgentUpdate,
        actor: &AuditActor,
    ) -> Result<Agent, ApiError> {
        if let Some(endpoint) = &update.endpoint {
            Self::validate_endpoint(endpoint)?;
        }

        let updated = {
            let db = self.db.lock().await;
            let current = db.get_agent(id).map_err(|_| agent_not_found(id))?;
            let updated = current.apply_update(update, Utc::now());
            updated.validate().map_err(ApiError::Validation)?;
            db.update_agent(&updated)?;
            updated
        };
        self.invalidate_cache().await;

        self.audit
            .append(
                "agent.updated",
                actor,
                Some("agent"),
                Some(id),
                details(&[("name", &updated.name)]),
            )
            .await?;

        Ok(updated)
    }

    pub async fn delete(&self, id: &str, actor: &AuditActor) -> Result<(), ApiError> {
        let deleted = {
            let db = self.db.lock().await;
            db.delete_agent(id)?
        };
        if !deleted {
            return Err(agent_not_found(id));
        }
        self.invalidate_cache().await;

        self.audit
            .append("agent.deleted", actor, Some("agent"), Some(id), Default::default())
            .await?;

        tracing::info!(id, "agent deleted");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<AgentWithHealth>, ApiError> {
        let db = self.db.lock().await;
        let agents = db.list_agents()?;

        let mut out = Vec::with_capacity(agents.len());
        for agent in agents {
            let health = db
                .get_agent_health(&agent.id)
                .unwrap_or_else(|_| AgentHealth::initial(agent.id.clone(), Utc::now()));
            out.push(AgentWithHealth { agent, health });
        }
        Ok(out)
    }

    pub async fn invalidate_cache(&self) {
        self.cache.lock().await.invalidate();
    }

    /// Weighted pick over the cached online set; `None` when no agent is
    /// currently healthy.
    pub async fn select_agent(&self) -> Result<Option<Agent>, ApiError> {
        let mut cache = self.cache.lock().await;
        if cache.is_stale() {
            let online = {
                let db = self.db.lock().await;
                db.list_online_agents()?
            };
            cache.reload(online);
        }
        Ok(cache.pick())
    }

    /// Probe one agent now and persist the observation.
    pub async fn probe_agent(&self, id: &str) -> Result<AgentHealth, ApiError> {
        let agent = {
            let db = self.db.lock().await;
            db.get_agent(id).map_err(|_| agent_not_found(id))?
        };
        Ok(self.probe_and_record(&agent).await)
    }

    async fn probe_and_record(&self, agent: &Agent) -> AgentHealth {
        let outcome = self.backend.probe(&agent.endpoint).await;
        let now = Utc::now();

        let db = self.db.lock().await;
        let current = db
            .get_agent_health(&agent.id)
            .unwrap_or_else(|_| AgentHealth::initial(agent.id.clone(), now));
        let updated = current.with_probe(outcome.status, outcome.latency_ms, outcome.details, now);
        if let Err(e) = db.upsert_agent_health(&updated) {
            tracing::warn!(agent = %agent.id, error = %e, "failed to persist probe result");
        }
        updated
    }

    /// One pass of the background health sweep: probe every registered
    /// agent concurrently.
    pub async fn sweep(self: &Arc<Self>) {
        let agents = {
            let db = self.db.lock().await;
            match db.list_agents() {
                Ok(agents) => agents,
                Err(e) => {
                    tracing::warn!(error = %e, "health sweep could not list agents");
                    return;
                }
            }
        };

        let mut set = tokio::task::JoinSet::new();
        for agent in agents {
            let this = Arc::clone(self);
            set.spawn(async move {
                let health = this.probe_and_record(&agent).await;
                tracing::debug!(
                    agent = %agent.id,
                    status = health.status.as_str(),
                    latency_ms = health.latency_ms,
                    "probe complete"
                );
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Full dispatch: resolve agent, call it, reconcile metrics, append the
    /// audit record, then answer. An audit failure fails the dispatch.
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        user: &CurrentUser,
        ip: &ClientIp,
    ) -> Result<DispatchResponse, ApiError> {
        if request.message.trim().is_empty() {
            return Err(ApiError::Validation("message must not be empty".into()));
        }

        // Explicit targeting skips selection and the health gate; the
        // caller chose.
        let agent = match &request.agent_id {
            Some(id) => {
                let db = self.db.lock().await;
                db.get_agent(id).map_err(|_| agent_not_found(id))?
            }
            None => self.select_agent().await?.ok_or_else(|| {
                ApiError::ExternalService {
                    service: "orchestrator".into(),
                    detail: "no healthy agents available".into(),
                }
            })?,
        };

        let session_id = request.session_id.unwrap_or_else(random_id);
        let messages = build_messages(request.context, &request.message);

        let started = Instant::now();
        let result = self.backend.chat(&agent, &messages).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let now = Utc::now();

        // Metric reconciliation happens before the audit append, which
        // happens before the response.
        {
            let db = self.db.lock().await;
            let health = db
                .get_agent_health(&agent.id)
                .unwrap_or_else(|_| AgentHealth::initial(agent.id.clone(), now));
            let updated = health.record_request(result.is_ok(), latency_ms, now);
            if let Err(e) = db.upsert_agent_health(&updated) {
                tracing::warn!(agent = %agent.id, error = %e, "failed to persist dispatch metrics");
            }
        }

        let actor = AuditActor::from_user(user, ip.0.map(|ip| ip.to_string()));
        match result {
            Ok(outcome) => {
                let session = {
                    let mut db = self.db.lock().await;
                    db.record_dispatch(&session_id, &agent.id, &agent.model, outcome.tokens_used, now)?
                };
                tracing::debug!(
                    session = %session.id,
                    peanuts = session.peanuts,
                    "dispatch session updated"
                );

                let mut audit_details = details(&[("session_id", &session_id), ("model", &agent.model)]);
                audit_details.insert("tokens_used".into(), outcome.tokens_used.into());
                audit_details.insert("latency_ms".into(), latency_ms.into());
                audit_details.insert("success".into(), true.into());
                self.audit
                    .append("agent.request", &actor, Some("agent"), Some(&agent.id), audit_details)
                    .await?;

                Ok(DispatchResponse {
                    request_id: random_id(),
                    agent_id: agent.id,
                    session_id,
                    message: outcome.content,
                    model: agent.model,
                    tokens_used: outcome.tokens_used,
                    latency_ms,
                    timestamp: now,
                })
            }
            Err(err) => {
                let mut audit_details = details(&[("session_id", &session_id), ("model", &agent.model)]);
                audit_details.insert("latency_ms".into(), latency_ms.into());
                audit_details.insert("success".into(), false.into());
                audit_details.insert("error".into(), err.to_string().into());
                self.audit
                    .append("agent.request", &actor, Some("agent"), Some(&agent.id), audit_details)
                    .await?;

                Err(err)
            }
        }
    }
}

fn agent_not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("Agent not found: {id}"))
}

fn details(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}

// ─── HTTP handlers ───

/// GET /api/v1/agents (any role)
pub async fn list_agents(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<Vec<AgentWithHealth>>, ApiError> {
    Ok(Json(state.orchestrator.list().await?))
}

/// POST /api/v1/agents (admin/operator)
pub async fn create_agent(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Json<AgentWithHealth>, ApiError> {
    user.require_operator()?;
    let actor = AuditActor::from_user(&user, ip.0.map(|i| i.to_string()));
    Ok(Json(state.orchestrator.create(request, &actor).await?))
}

/// PUT /api/v1/agents/{id} (admin/operator)
pub async fn update_agent(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    Path(id): Path<String>,
    Json(update): Json<AgentUpdate>,
) -> Result<Json<Agent>, ApiError> {
    user.require_operator()?;
    let actor = AuditActor::from_user(&user, ip.0.map(|i| i.to_string()));
    Ok(Json(state.orchestrator.update(&id, update, &actor).await?))
}

/// DELETE /api/v1/agents/{id} (admin)
pub async fn delete_agent(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    user.require_admin()?;
    let actor = AuditActor::from_user(&user, ip.0.map(|i| i.to_string()));
    state.orchestrator.delete(&id, &actor).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// GET /api/v1/agents/{id}/health (any role) — forces a probe.
pub async fn agent_health(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<AgentHealth>, ApiError> {
    Ok(Json(state.orchestrator.probe_agent(&id).await?))
}

/// POST /api/v1/openclaw/dispatch (any role)
pub async fn dispatch(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    state
        .limiter
        .check(&format!("dispatch:{}", user.user_id), &DISPATCH_POLICY)
        .await?;

    Ok(Json(state.orchestrator.dispatch(request, &user, &ip).await?))
}

/// GET /api/v1/openclaw/sessions (any role)
pub async fn list_dispatch_sessions(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<Vec<DispatchSession>>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(db.list_dispatch_sessions()?))
}
