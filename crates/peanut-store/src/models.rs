use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub password_hash: String,
    pub role: Role,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub backup_codes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

// Mutators return new values; the caller persists the replacement row.
impl User {
    pub fn record_login(&self, now: DateTime<Utc>) -> User {
        User {
            last_login_at: Some(now),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Persisting the returned value is what makes TOTP required at login.
    pub fn enable_totp(
        &self,
        secret: String,
        backup_codes: Vec<String>,
        now: DateTime<Utc>,
    ) -> User {
        User {
            totp_secret: Some(secret),
            totp_enabled: true,
            backup_codes,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Consume a backup code. Returns the updated user on a match, `None`
    /// when the code is absent (including a second use of the same code).
    pub fn use_backup_code(&self, code: &str, now: DateTime<Utc>) -> Option<User> {
        let needle = code.to_uppercase();
        let pos = self.backup_codes.iter().position(|c| *c == needle)?;

        let mut remaining = self.backup_codes.clone();
        remaining.remove(pos);

        Some(User {
            backup_codes: remaining,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn with_password_hash(&self, password_hash: String, now: DateTime<Utc>) -> User {
        User {
            password_hash,
            updated_at: now,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    LocalInference,
    CodeAssistant,
    HostedA,
    HostedB,
    Custom,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::LocalInference => "local_inference",
            AgentType::CodeAssistant => "code_assistant",
            AgentType::HostedA => "hosted_a",
            AgentType::HostedB => "hosted_b",
            AgentType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<AgentType> {
        match s {
            "local_inference" => Some(AgentType::LocalInference),
            "code_assistant" => Some(AgentType::CodeAssistant),
            "hosted_a" => Some(AgentType::HostedA),
            "hosted_b" => Some(AgentType::HostedB),
            "custom" => Some(AgentType::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub priority: u32,
    pub weight: u32,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for an agent; the type is fixed at creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub priority: Option<u32>,
    pub weight: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Agent {
    /// Numeric-range and shape checks shared by create and update.
    /// The endpoint URL itself is validated at the boundary.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.chars().count() < 2 || self.name.chars().count() > 64 {
            return Err("name must be 2-64 characters".into());
        }
        if self.model.is_empty() {
            return Err("model must not be empty".into());
        }
        if self.max_tokens < 1 || self.max_tokens > 200_000 {
            return Err("max_tokens must be between 1 and 200000".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err("temperature must be between 0.0 and 2.0".into());
        }
        if self.priority < 1 || self.priority > 10 {
            return Err("priority must be between 1 and 10".into());
        }
        if self.weight < 1 || self.weight > 100 {
            return Err("weight must be between 1 and 100".into());
        }
        Ok(())
    }

    pub fn apply_update(&self, update: AgentUpdate, now: DateTime<Utc>) -> Agent {
        Agent {
            name: update.name.unwrap_or_else(|| self.name.clone()),
            endpoint: update.endpoint.unwrap_or_else(|| self.endpoint.clone()),
            model: update.model.unwrap_or_else(|| self.model.clone()),
            max_tokens: update.max_tokens.unwrap_or(self.max_tokens),
            temperature: update.temperature.unwrap_or(self.temperature),
            priority: update.priority.unwrap_or(self.priority),
            weight: update.weight.unwrap_or(self.weight),
            tags: update.tags.unwrap_or_else(|| self.tags.clone()),
            metadata: update.metadata.unwrap_or_else(|| self.metadata.clone()),
            updated_at: now,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Online,
    Offline,
    Degraded,
    Maintenance,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Online => "online",
            HealthStatus::Offline => "offline",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Maintenance => "maintenance",
        }
    }

    pub fn parse(s: &str) -> Option<HealthStatus> {
        match s {
            "online" => Some(HealthStatus::Online),
            "offline" => Some(HealthStatus::Offline),
            "degraded" => Some(HealthStatus::Degraded),
            "maintenance" => Some(HealthStatus::Maintenance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentHealth {
    pub agent_id: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub success_rate: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub last_checked_at: DateTime<Utc>,
    pub details: String,
}

fn success_rate(request_count: u64, error_count: u64) -> f64 {
    if request_count == 0 {
        1.0
    } else {
        (request_count - error_count) as f64 / request_count as f64
    }
}

impl AgentHealth {
    pub fn initial(agent_id: String, now: DateTime<Utc>) -> AgentHealth {
        AgentHealth {
            agent_id,
            status: HealthStatus::Offline,
            latency_ms: 0,
            success_rate: 1.0,
            request_count: 0,
            error_count: 0,
            last_checked_at: now,
            details: "not yet probed".into(),
        }
    }

    /// Outcome of a health probe. Request counters are untouched; probes
    /// are not traffic.
    pub fn with_probe(
        &self,
        status: HealthStatus,
        latency_ms: u64,
        details: String,
        now: DateTime<Utc>,
    ) -> AgentHealth {
        AgentHealth {
            status,
            latency_ms,
            details,
            last_checked_at: now,
            success_rate: success_rate(self.request_count, self.error_count),
            ..self.clone()
        }
    }

    /// Outcome of a dispatched backend call.
    pub fn record_request(&self, success: bool, latency_ms: u64, now: DateTime<Utc>) -> AgentHealth {
        let request_count = self.request_count + 1;
        let error_count = self.error_count + u64::from(!success);

        AgentHealth {
            status: if success {
                HealthStatus::Online
            } else {
                HealthStatus::Degraded
            },
            latency_ms,
            success_rate: success_rate(request_count, error_count),
            request_count,
            error_count,
            last_checked_at: now,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub action: String,
    pub actor_user_id: Option<String>,
    pub actor_email: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub previous_fingerprint: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// The exact ISO form the fingerprint is computed over and the row
    /// stores: RFC 3339, microsecond precision, `Z` suffix.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Filters for audit queries. All fields are optional and conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl Session {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultConfig {
    pub api_key_ciphertext: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens_per_request: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSession {
    pub id: String,
    pub agent_id: Option<String>,
    pub model: Option<String>,
    pub peanuts: u64,
    pub request_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        let now = Utc::now();
        User {
            id: "u1".into(),
            email: "a@b.c".into(),
            display_name: "A".into(),
            password_hash: "aa:bb".into(),
            role: Role::Viewer,
            totp_secret: None,
            totp_enabled: false,
            backup_codes: vec!["AABBCCDD".into(), "11223344".into()],
            created_at: now,
            updated_at: now,
            last_login_at: None,
        }
    }

    #[test]
    fn mutators_do_not_touch_the_original() {
        let user = sample_user();
        let now = Utc::now();

        let _ = user.enable_totp("SECRET".into(), vec![], now);
        let _ = user.use_backup_code("AABBCCDD", now);
        let _ = user.with_password_hash("cc:dd".into(), now);

        assert!(!user.totp_enabled);
        assert_eq!(user.backup_codes.len(), 2);
        assert_eq!(user.password_hash, "aa:bb");
    }

    #[test]
    fn backup_code_consumed_once() {
        let user = sample_user();
        let now = Utc::now();

        let after = user.use_backup_code("aabbccdd", now).unwrap();
        assert_eq!(after.backup_codes, vec!["11223344".to_string()]);
        assert!(after.use_backup_code("AABBCCDD", now).is_none());
    }

    #[test]
    fn enable_totp_implies_secret() {
        let user = sample_user().enable_totp("SECRET".into(), vec!["X".into()], Utc::now());
        assert!(user.totp_enabled);
        assert!(user.totp_secret.is_some());
    }

    #[test]
    fn agent_validation_ranges() {
        let now = Utc::now();
        let agent = Agent {
            id: "a1".into(),
            name: "llama".into(),
            agent_type: AgentType::LocalInference,
            endpoint: "http://localhost:11434".into(),
            model: "qwen2.5:7b".into(),
            max_tokens: 4096,
            temperature: 0.0,
            priority: 5,
            weight: 10,
            tags: vec![],
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };
        assert!(agent.validate().is_ok());

        assert!(Agent { name: "x".into(), ..agent.clone() }.validate().is_err());
        assert!(Agent { max_tokens: 0, ..agent.clone() }.validate().is_err());
        assert!(Agent { max_tokens: 200_001, ..agent.clone() }.validate().is_err());
        assert!(Agent { temperature: 2.5, ..agent.clone() }.validate().is_err());
        assert!(Agent { priority: 0, ..agent.clone() }.validate().is_err());
        assert!(Agent { weight: 101, ..agent.clone() }.validate().is_err());
        assert!(Agent { model: String::new(), ..agent }.validate().is_err());
    }

    #[test]
    fn update_cannot_change_type() {
        let now = Utc::now();
        let agent = Agent {
            id: "a1".into(),
            name: "llama".into(),
            agent_type: AgentType::LocalInference,
            endpoint: "http://localhost:11434".into(),
            model: "qwen2.5:7b".into(),
            max_tokens: 4096,
            temperature: 0.0,
            priority: 5,
            weight: 10,
            tags: vec![],
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };

        let updated = agent.apply_update(
            AgentUpdate {
                name: Some("llama-2".into()),
                weight: Some(20),
                ..Default::default()
            },
            now,
        );

        assert_eq!(updated.agent_type, AgentType::LocalInference);
        assert_eq!(updated.name, "llama-2");
        assert_eq!(updated.weight, 20);
        assert_eq!(updated.endpoint, agent.endpoint);
    }

    #[test]
    fn success_rate_invariant() {
        let now = Utc::now();
        let health = AgentHealth::initial("a1".into(), now);
        assert_eq!(health.success_rate, 1.0);

        let h1 = health.record_request(true, 12, now);
        assert_eq!(h1.request_count, 1);
        assert_eq!(h1.success_rate, 1.0);
        assert_eq!(h1.status, HealthStatus::Online);

        let h2 = h1.record_request(false, 30, now);
        assert_eq!(h2.request_count, 2);
        assert_eq!(h2.error_count, 1);
        assert_eq!(h2.success_rate, 0.5);
        assert_eq!(h2.status, HealthStatus::Degraded);
    }

    #[test]
    fn probe_preserves_counters() {
        let now = Utc::now();
        let health = AgentHealth::initial("a1".into(), now)
            .record_request(true, 10, now)
            .record_request(false, 10, now);

        let probed = health.with_probe(HealthStatus::Online, 7, "HTTP 200".into(), now);
        assert_eq!(probed.request_count, 2);
        assert_eq!(probed.error_count, 1);
        assert_eq!(probed.latency_ms, 7);
        assert_eq!(probed.status, HealthStatus::Online);
    }

    #[test]
    fn audit_timestamp_iso_round_trips() {
        let entry = AuditEntry {
            id: "e1".into(),
            action: "auth.login".into(),
            actor_user_id: None,
            actor_email: None,
            ip: None,
            user_agent: None,
            resource_type: None,
            resource_id: None,
            details: serde_json::Map::new(),
            previous_fingerprint: "GENESIS".into(),
            fingerprint: String::new(),
            timestamp: Utc::now(),
        };

        let iso = entry.timestamp_iso();
        let parsed: DateTime<Utc> = iso.parse().unwrap();
        let reparsed = AuditEntry { timestamp: parsed, ..entry };
        assert_eq!(reparsed.timestamp_iso(), iso);
    }
}
