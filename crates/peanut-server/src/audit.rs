//! Tamper-evident audit chain.
//!
//! Every privileged operation appends an entry whose fingerprint covers the
//! previous entry's fingerprint, so an out-of-band edit to any row breaks
//! verification of that row onward. Reads recompute fingerprints and report
//! the result; tampered rows are surfaced, never hidden.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use peanut_shared::constants::GENESIS_FINGERPRINT;
use peanut_shared::crypto::{random_id, sha256_hex};
use peanut_store::{AuditEntry, AuditFilter, Database};

use crate::api::AppState;
use crate::error::ApiError;
use crate::session::CurrentUser;

/// Who did it, as seen at the boundary. All fields are optional because
/// some entries (failed logins) have no authenticated actor.
#[derive(Debug, Clone, Default)]
pub struct AuditActor {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditActor {
    pub fn from_user(user: &CurrentUser, ip: Option<String>) -> Self {
        AuditActor {
            user_id: Some(user.user_id.clone()),
            email: Some(user.email.clone()),
            ip,
            user_agent: None,
        }
    }
}

/// SHA-256 over the canonical sorted-key JSON of the chained fields, with
/// the timestamp rendered exactly as stored.
pub fn compute_fingerprint(entry: &AuditEntry) -> String {
    let payload = serde_json::json!({
        "id": entry.id,
        "action": entry.action,
        "actor_user_id": entry.actor_user_id,
        "resource_type": entry.resource_type,
        "resource_id": entry.resource_id,
        "details": entry.details,
        "previous_fingerprint": entry.previous_fingerprint,
        "timestamp": entry.timestamp_iso(),
    });
    sha256_hex(payload.to_string().as_bytes())
}

#[derive(Clone)]
pub struct AuditChain {
    db: Arc<Mutex<Database>>,
}

#[derive(Debug, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub total: u64,
    pub page: u64,
    pub pages: u64,
    pub integrity_ok: bool,
}

impl AuditChain {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        action: &str,
        actor: &AuditActor,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        details: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditEntry, ApiError> {
        let mut db = self.db.lock().await;

        let entry = db.append_audit(|previous| {
            let now = Utc::now();
            // Round-trip through the stored text form so the fingerprinted
            // timestamp and the persisted one are byte-identical.
            let iso = now.to_rfc3339_opts(SecondsFormat::Micros, true);
            let timestamp = DateTime::parse_from_rfc3339(&iso)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(now);

            let mut entry = AuditEntry {
                id: random_id(),
                action: action.to_string(),
                actor_user_id: actor.user_id.clone(),
                actor_email: actor.email.clone(),
                ip: actor.ip.clone(),
                user_agent: actor.user_agent.clone(),
                resource_type: resource_type.map(str::to_string),
                resource_id: resource_id.map(str::to_string),
                details,
                previous_fingerprint: previous
                    .unwrap_or_else(|| GENESIS_FINGERPRINT.to_string()),
                fingerprint: String::new(),
                timestamp,
            };
            entry.fingerprint = compute_fingerprint(&entry);
            entry
        })?;

        tracing::debug!(action = %entry.action, id = %entry.id, "audit entry appended");
        Ok(entry)
    }

    pub async fn query(
        &self,
        filter: &AuditFilter,
        page: u64,
        limit: u64,
    ) -> Result<AuditPage, ApiError> {
        let page = page.max(1);
        let limit = limit.clamp(1, 500);

        let (entries, total) = {
            let db = self.db.lock().await;
            db.query_audit(filter, limit, (page - 1) * limit)?
        };

        let integrity_ok = entries
            .iter()
            .all(|e| compute_fingerprint(e) == e.fingerprint);
        if !integrity_ok {
            tracing::warn!("audit chain integrity check failed on read");
        }

        Ok(AuditPage {
            total,
            page,
            pages: total.div_ceil(limit),
            integrity_ok,
            entries,
        })
    }
}

// ─── HTTP handler ───

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub page: Option<u64>,
    pub limit: Option<u64>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub(crate) struct AuditResponse {
    entries: Vec<AuditEntry>,
    total: u64,
    page: u64,
    pages: u64,
    integrity_valid: bool,
}

/// GET /api/v1/audit (admin/operator)
pub async fn query_audit(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<AuditQueryParams>,
) -> Result<Json<AuditResponse>, ApiError> {
    user.require_operator()?;

    let filter = AuditFilter {
        actor_id: params.actor_id,
        action: params.action,
        resource_type: params.resource_type,
        from: params.from,
        to: params.to,
    };
    let page = state
        .audit
        .query(&filter, params.page.unwrap_or(1), params.limit.unwrap_or(50))
        .await?;

    Ok(Json(AuditResponse {
        entries: page.entries,
        total: page.total,
        page: page.page,
        pages: page.pages,
        integrity_valid: page.integrity_ok,
    }))
}
