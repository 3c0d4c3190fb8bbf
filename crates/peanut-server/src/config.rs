use std::net::SocketAddr;
use std::path::PathBuf;

use peanut_shared::constants::DEFAULT_HTTP_PORT;
use peanut_shared::crypto::{vault_key_from_hex, VaultKey};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub cors_origins: Vec<String>,
    pub session_secret: String,
    pub vault_key: VaultKey,
    pub default_admin_password: String,
    pub production: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            data_dir: PathBuf::from("./data"),
            cors_origins: vec![],
            session_secret: "peanut-dev-session-secret-do-not-use-in-prod".to_string(),
            vault_key: [0u8; 32],
            default_admin_password: "peanut-change-me".to_string(),
            production: false,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("LISTEN_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                config.http_addr = ([0, 0, 0, 0], parsed).into();
            } else {
                tracing::warn!(value = %port, "Invalid LISTEN_PORT, using default");
            }
        }

        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(csv) = std::env::var("CORS_ORIGIN") {
            config.cors_origins = csv
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            if secret.len() >= 32 {
                config.session_secret = secret;
            } else {
                tracing::warn!(
                    len = secret.len(),
                    "SESSION_SECRET shorter than 32 bytes, using dev default"
                );
            }
        } else {
            tracing::warn!("SESSION_SECRET not set, using dev default");
        }

        if let Ok(key_hex) = std::env::var("VAULT_KEY_HEX") {
            if key_hex.len() != 64 {
                tracing::warn!(
                    len = key_hex.len(),
                    "VAULT_KEY_HEX is not 64 hex chars, normalizing to 32 bytes"
                );
            }
            config.vault_key = vault_key_from_hex(&key_hex);
        } else {
            tracing::warn!("VAULT_KEY_HEX not set, vault uses an all-zero key");
        }

        if let Ok(password) = std::env::var("DEFAULT_ADMIN_PASSWORD") {
            if !password.is_empty() {
                config.default_admin_password = password;
            }
        }

        if let Ok(env) = std::env::var("ENVIRONMENT") {
            config.production = env.eq_ignore_ascii_case("production");
        }

        config
    }

    /// Allow every origin when none is configured or `*` is listed.
    pub fn cors_allows_any(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(!config.production);
        assert!(config.cors_allows_any());
    }

    #[test]
    fn test_cors_wildcard() {
        let mut config = GatewayConfig::default();
        config.cors_origins = vec!["https://ui.peanut.local".into()];
        assert!(!config.cors_allows_any());

        config.cors_origins.push("*".into());
        assert!(config.cors_allows_any());
    }
}
