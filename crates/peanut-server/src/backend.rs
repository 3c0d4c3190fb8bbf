//! Outbound calls to agent backends: health probes and chat completions.
//!
//! The chat wire format is the Ollama-compatible `/api/chat` shape; token
//! accounting is `prompt_eval_count + eval_count` from the response.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use peanut_store::{Agent, HealthStatus};

use crate::error::ApiError;

/// Health probe hard deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Chat call hard deadline.
const CHAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub details: String,
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub content: String,
    pub tokens_used: u64,
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    options: ChatOptions,
    stream: bool,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    #[serde(default)]
    message: ChatApiMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Deserialize, Default)]
struct ChatApiMessage {
    #[serde(default)]
    content: String,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Deadlines are per call; the client itself carries none.
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }

    /// GET the endpoint root and map the outcome: 2xx is online, any other
    /// status is degraded, transport failure or timeout is offline.
    pub async fn probe(&self, endpoint: &str) -> ProbeOutcome {
        let started = Instant::now();
        let result = self
            .http
            .get(endpoint)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => ProbeOutcome {
                status: HealthStatus::Online,
                latency_ms,
                details: format!("HTTP {}", response.status().as_u16()),
            },
            Ok(response) => ProbeOutcome {
                status: HealthStatus::Degraded,
                latency_ms,
                details: format!("HTTP {}", response.status().as_u16()),
            },
            Err(e) => ProbeOutcome {
                status: HealthStatus::Offline,
                latency_ms,
                details: e.to_string(),
            },
        }
    }

    /// POST a chat completion to the agent with a 30 s hard deadline.
    pub async fn chat(
        &self,
        agent: &Agent,
        messages: &[ChatMessage],
    ) -> Result<ChatOutcome, ApiError> {
        let url = format!("{}/api/chat", agent.endpoint.trim_end_matches('/'));
        let payload = ChatPayload {
            model: &agent.model,
            messages,
            options: ChatOptions {
                temperature: agent.temperature,
            },
            stream: false,
        };

        let response = self
            .http
            .post(&url)
            .timeout(CHAT_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::ExternalService {
                service: agent.name.clone(),
                detail: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ApiError::ExternalService {
                service: agent.name.clone(),
                detail: format!("HTTP {}", response.status().as_u16()),
            });
        }

        let body: ChatApiResponse =
            response.json().await.map_err(|e| ApiError::ExternalService {
                service: agent.name.clone(),
                detail: format!("invalid response body: {e}"),
            })?;

        Ok(ChatOutcome {
            content: body.message.content,
            tokens_used: body.prompt_eval_count + body.eval_count,
        })
    }
}

/// The message list for one dispatch: caller-supplied context followed by
/// the user turn.
pub fn build_messages(context: Vec<ChatMessage>, message: &str) -> Vec<ChatMessage> {
    let mut messages = context;
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: message.to_string(),
    });
    messages
}
