//! Credential vault: the upstream code-assistant API key encrypted at rest,
//! plus the proxied completion and usage calls that consume it.
//!
//! The decrypted key exists only inside this process while a request is in
//! flight; it is never written back, logged, or returned to the boundary.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use peanut_shared::crypto::{decrypt_from_string, encrypt_to_string, VaultKey};
use peanut_store::{Database, VaultConfig};

use crate::api::AppState;
use crate::audit::AuditActor;
use crate::backend::ChatMessage;
use crate::error::ApiError;
use crate::rate_limit::{ClientIp, VAULT_COMPLETE_POLICY};
use crate::session::CurrentUser;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Completion proxy hard deadline.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Usage probe deadline; probes should fail fast.
const USAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct VaultConfigUpdate {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens_per_request: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct VaultConfigView {
    pub has_api_key: bool,
    pub base_url: String,
    pub model: String,
    pub max_tokens_per_request: u32,
}

#[derive(Debug, Deserialize)]
pub struct VaultCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub system: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VaultUsageView {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct VaultCompletionResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub usage: VaultUsageView,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UsageSnapshot {
    pub used: u64,
    pub limit: u64,
    pub reset_at: Option<String>,
    pub percentage: u64,
}

#[derive(Debug, Serialize)]
pub struct VaultStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

// Upstream wire shapes (`/v1/messages`, `/v1/usage`).

#[derive(Serialize)]
struct UpstreamCompletionBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Deserialize)]
struct UpstreamCompletion {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<UpstreamContentBlock>,
    #[serde(default)]
    usage: UpstreamUsage,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct UpstreamUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct UpstreamUsageReport {
    #[serde(default)]
    used: u64,
    #[serde(default)]
    limit: u64,
    reset_at: Option<String>,
}

#[derive(Clone)]
pub struct VaultService {
    db: Arc<Mutex<Database>>,
    key: VaultKey,
    http: reqwest::Client,
}

impl VaultService {
    pub fn new(db: Arc<Mutex<Database>>, key: VaultKey) -> Result<Self, reqwest::Error> {
        Ok(Self {
            db,
            key,
            http: reqwest::Client::builder().build()?,
        })
    }

    async fn effective_config(&self) -> Result<VaultConfig, ApiError> {
        let db = self.db.lock().await;
        Ok(db.get_vault_config()?.unwrap_or_else(default_config))
    }

    pub async fn config_view(&self) -> Result<VaultConfigView, ApiError> {
        let config = self.effective_config().await?;
        Ok(VaultConfigView {
            has_api_key: config.api_key_ciphertext.is_some(),
            base_url: config.base_url,
            model: config.model,
            max_tokens_per_request: config.max_tokens_per_request,
        })
    }

    /// Overwrite the non-credential fields; re-encrypt the key only when a
    /// new one is supplied, otherwise keep the stored ciphertext.
    pub async fn update_config(
        &self,
        update: VaultConfigUpdate,
    ) -> Result<VaultConfigView, ApiError> {
        let current = self.effective_config().await?;

        let api_key_ciphertext = match update.api_key.as_deref() {
            Some(key) if !key.is_empty() => Some(encrypt_to_string(&self.key, key.as_bytes())?),
            _ => current.api_key_ciphertext,
        };

        let config = VaultConfig {
            api_key_ciphertext,
            base_url: normalize_base_url(
                update.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            ),
            model: update.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens_per_request: update.max_tokens_per_request.unwrap_or(DEFAULT_MAX_TOKENS),
            updated_at: Utc::now(),
        };

        {
            let db = self.db.lock().await;
            db.upsert_vault_config(&config)?;
        }
        tracing::info!(
            base_url = %config.base_url,
            model = %config.model,
            "vault configuration updated"
        );

        Ok(VaultConfigView {
            has_api_key: config.api_key_ciphertext.is_some(),
            base_url: config.base_url,
            model: config.model,
            max_tokens_per_request: config.max_tokens_per_request,
        })
    }

    fn decrypt_api_key(&self, config: &VaultConfig) -> Result<String, ApiError> {
        let ciphertext = config
            .api_key_ciphertext
            .as_deref()
            .ok_or_else(|| ApiError::Validation("vault API key not configured".into()))?;

        let plaintext =
            decrypt_from_string(&self.key, ciphertext).map_err(|_| ApiError::ExternalService {
                service: "vault".into(),
                detail: "credential decryption failed".into(),
            })?;
        String::from_utf8(plaintext).map_err(|_| ApiError::ExternalService {
            service: "vault".into(),
            detail: "credential decryption failed".into(),
        })
    }

    pub async fn complete(
        &self,
        request: VaultCompletionRequest,
    ) -> Result<VaultCompletionResponse, ApiError> {
        if request.messages.is_empty() {
            return Err(ApiError::Validation("messages must not be empty".into()));
        }

        let config = self.effective_config().await?;
        let api_key = self.decrypt_api_key(&config)?;

        let max_tokens = request
            .max_tokens
            .unwrap_or(config.max_tokens_per_request)
            .min(config.max_tokens_per_request);
        let model = request.model.as_deref().unwrap_or(&config.model);

        let body = UpstreamCompletionBody {
            model,
            max_tokens,
            messages: &request.messages,
            system: request.system.as_deref(),
            temperature: request.temperature,
        };

        let response = self
            .http
            .post(format!("{}/v1/messages", config.base_url))
            .timeout(COMPLETION_TIMEOUT)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| upstream_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(upstream_error(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let upstream: UpstreamCompletion = response
            .json()
            .await
            .map_err(|e| upstream_error(format!("invalid response body: {e}")))?;

        let content = upstream
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        Ok(VaultCompletionResponse {
            id: upstream.id,
            model: upstream.model,
            content,
            usage: VaultUsageView {
                prompt: upstream.usage.input_tokens,
                completion: upstream.usage.output_tokens,
                total: upstream.usage.input_tokens + upstream.usage.output_tokens,
            },
            finish_reason: upstream.stop_reason,
        })
    }

    pub async fn usage(&self) -> Result<UsageSnapshot, ApiError> {
        let config = self.effective_config().await?;
        let api_key = self.decrypt_api_key(&config)?;

        let response = self
            .http
            .get(format!("{}/v1/usage", config.base_url))
            .timeout(USAGE_TIMEOUT)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| upstream_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(upstream_error(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }

        let report: UpstreamUsageReport = response
            .json()
            .await
            .map_err(|e| upstream_error(format!("invalid response body: {e}")))?;

        Ok(usage_snapshot(report.used, report.limit, report.reset_at))
    }

    /// Connection status for the UI. Decryption or upstream failures read
    /// as "not connected"; their details never cross the boundary.
    pub async fn status(&self) -> VaultStatus {
        let has_key = match self.effective_config().await {
            Ok(config) => config.api_key_ciphertext.is_some(),
            Err(_) => false,
        };
        if !has_key {
            return VaultStatus {
                connected: false,
                usage: None,
            };
        }

        match self.usage().await {
            Ok(usage) => VaultStatus {
                connected: true,
                usage: Some(usage),
            },
            Err(e) => {
                tracing::debug!(error = %e, "vault status probe failed");
                VaultStatus {
                    connected: false,
                    usage: None,
                }
            }
        }
    }
}

fn default_config() -> VaultConfig {
    VaultConfig {
        api_key_ciphertext: None,
        base_url: DEFAULT_BASE_URL.to_string(),
        model: DEFAULT_MODEL.to_string(),
        max_tokens_per_request: DEFAULT_MAX_TOKENS,
        updated_at: Utc::now(),
    }
}

fn normalize_base_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

fn upstream_error(detail: String) -> ApiError {
    ApiError::ExternalService {
        service: "code-assistant".into(),
        detail,
    }
}

fn usage_snapshot(used: u64, limit: u64, reset_at: Option<String>) -> UsageSnapshot {
    let percentage = if limit == 0 {
        0
    } else {
        (used as f64 / limit as f64 * 100.0).round() as u64
    };
    UsageSnapshot {
        used,
        limit,
        reset_at,
        percentage,
    }
}

// ─── HTTP handlers ───

/// GET /api/v1/vault/status (any role)
pub async fn vault_status(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Result<Json<VaultStatus>, ApiError> {
    Ok(Json(state.vault.status().await))
}

/// GET /api/v1/vault/config (admin)
pub async fn get_vault_config(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<VaultConfigView>, ApiError> {
    user.require_admin()?;
    Ok(Json(state.vault.config_view().await?))
}

/// PUT /api/v1/vault/config (admin)
pub async fn put_vault_config(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    Json(update): Json<VaultConfigUpdate>,
) -> Result<Json<VaultConfigView>, ApiError> {
    user.require_admin()?;

    let key_rotated = update.api_key.as_deref().is_some_and(|k| !k.is_empty());
    let view = state.vault.update_config(update).await?;

    let mut details = serde_json::Map::new();
    details.insert("setting".into(), "vault".into());
    details.insert("key_rotated".into(), key_rotated.into());
    state
        .audit
        .append(
            "settings.updated",
            &AuditActor::from_user(&user, ip.0.map(|i| i.to_string())),
            Some("vault"),
            None,
            details,
        )
        .await?;

    Ok(Json(view))
}

/// POST /api/v1/vault/complete (any role)
pub async fn vault_complete(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<VaultCompletionRequest>,
) -> Result<Json<VaultCompletionResponse>, ApiError> {
    state
        .limiter
        .check(&format!("vault_complete:{}", user.user_id), &VAULT_COMPLETE_POLICY)
        .await?;

    Ok(Json(state.vault.complete(request).await?))
}

/// GET /api/v1/vault/usage (admin/operator)
pub async fn vault_usage(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<UsageSnapshot>, ApiError> {
    user.require_operator()?;
    Ok(Json(state.vault.usage().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peanut_shared::crypto::vault_key_from_hex;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn service() -> VaultService {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        VaultService::new(db, vault_key_from_hex(&"ab".repeat(32))).unwrap()
    }

    fn spawn_stub(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn defaults_before_first_write() {
        let service = service();
        let view = service.config_view().await.unwrap();

        assert!(!view.has_api_key);
        assert_eq!(view.base_url, DEFAULT_BASE_URL);
        assert_eq!(view.model, DEFAULT_MODEL);
        assert_eq!(view.max_tokens_per_request, 8192);
    }

    #[tokio::test]
    async fn update_without_key_retains_ciphertext() {
        let service = service();

        service
            .update_config(VaultConfigUpdate {
                api_key: Some("sk-ant-secret".into()),
                base_url: None,
                model: None,
                max_tokens_per_request: None,
            })
            .await
            .unwrap();

        let view = service
            .update_config(VaultConfigUpdate {
                api_key: None,
                base_url: Some("https://assistant.internal/".into()),
                model: Some("claude-3-5-haiku-20241022".into()),
                max_tokens_per_request: Some(2048),
            })
            .await
            .unwrap();

        assert!(view.has_api_key);
        assert_eq!(view.base_url, "https://assistant.internal");
        assert_eq!(view.max_tokens_per_request, 2048);

        // Stored key still decrypts after the second write.
        let config = service.effective_config().await.unwrap();
        assert_eq!(service.decrypt_api_key(&config).unwrap(), "sk-ant-secret");
    }

    #[tokio::test]
    async fn empty_api_key_does_not_clobber() {
        let service = service();
        service
            .update_config(VaultConfigUpdate {
                api_key: Some("sk-ant-secret".into()),
                base_url: None,
                model: None,
                max_tokens_per_request: None,
            })
            .await
            .unwrap();

        let view = service
            .update_config(VaultConfigUpdate {
                api_key: Some(String::new()),
                base_url: None,
                model: None,
                max_tokens_per_request: None,
            })
            .await
            .unwrap();
        assert!(view.has_api_key);
    }

    #[tokio::test]
    async fn complete_requires_a_key() {
        let service = service();
        let err = service
            .complete(VaultCompletionRequest {
                model: None,
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "hi".into(),
                }],
                max_tokens: None,
                temperature: None,
                system: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn complete_maps_upstream_shape() {
        let service = service();
        let base_url = spawn_stub(
            r#"{"id":"msg_01","model":"claude-3-5-sonnet-20241022",
                "content":[{"type":"text","text":"pong"}],
                "usage":{"input_tokens":9,"output_tokens":3},
                "stop_reason":"end_turn"}"#
                .to_string(),
        );

        service
            .update_config(VaultConfigUpdate {
                api_key: Some("sk-ant-secret".into()),
                base_url: Some(base_url),
                model: None,
                max_tokens_per_request: Some(100),
            })
            .await
            .unwrap();

        let response = service
            .complete(VaultCompletionRequest {
                model: None,
                messages: vec![ChatMessage {
                    role: "user".into(),
                    content: "ping".into(),
                }],
                max_tokens: Some(5000),
                temperature: None,
                system: None,
            })
            .await
            .unwrap();

        assert_eq!(response.id, "msg_01");
        assert_eq!(response.content, "pong");
        assert_eq!(response.usage.prompt, 9);
        assert_eq!(response.usage.completion, 3);
        assert_eq!(response.usage.total, 12);
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn status_without_key_is_disconnected() {
        let service = service();
        let status = service.status().await;
        assert!(!status.connected);
        assert!(status.usage.is_none());
    }

    #[tokio::test]
    async fn status_with_unreachable_upstream_is_disconnected() {
        let service = service();
        service
            .update_config(VaultConfigUpdate {
                api_key: Some("sk-ant-secret".into()),
                base_url: Some("http://127.0.0.1:1".into()),
                model: None,
                max_tokens_per_request: None,
            })
            .await
            .unwrap();

        let status = service.status().await;
        assert!(!status.connected);
    }

    #[test]
    fn percentage_rounds_and_handles_zero_limit() {
        assert_eq!(usage_snapshot(0, 0, None).percentage, 0);
        assert_eq!(usage_snapshot(1, 3, None).percentage, 33);
        assert_eq!(usage_snapshot(2, 3, None).percentage, 67);
        assert_eq!(usage_snapshot(50, 100, None).percentage, 50);
    }
}
