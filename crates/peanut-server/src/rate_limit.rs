//! Adaptive rate limiting over persisted window counters.
//!
//! Counters live in the store so limits survive process restarts. Once a
//! caller overshoots, the advertised retry interval doubles for every ten
//! further requests, up to the policy cap.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use peanut_store::Database;

use crate::error::ApiError;

/// Buckets older than this many windows are pruned on write.
const RETENTION_WINDOWS: i64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u64,
    pub window_ms: i64,
    pub exponential_backoff: bool,
    pub max_backoff_ms: i64,
}

/// 10/min on the caller IP, backoff capped at 5 minutes.
pub const LOGIN_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_requests: 10,
    window_ms: 60_000,
    exponential_backoff: true,
    max_backoff_ms: 300_000,
};

/// 5/min on the caller IP, backoff capped at 10 minutes.
pub const TOTP_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_requests: 5,
    window_ms: 60_000,
    exponential_backoff: true,
    max_backoff_ms: 600_000,
};

/// 60/min per user, backoff capped at 5 minutes.
pub const DISPATCH_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_requests: 60,
    window_ms: 60_000,
    exponential_backoff: true,
    max_backoff_ms: 300_000,
};

/// 30/min per user, backoff capped at 10 minutes.
pub const VAULT_COMPLETE_POLICY: RateLimitPolicy = RateLimitPolicy {
    max_requests: 30,
    window_ms: 60_000,
    exponential_backoff: true,
    max_backoff_ms: 600_000,
};

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub limit: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    db: Arc<Mutex<Database>>,
}

impl RateLimiter {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    pub async fn check(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, ApiError> {
        self.check_at(key, policy, Utc::now().timestamp_millis())
            .await
    }

    async fn check_at(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> Result<RateLimitDecision, ApiError> {
        let window_start = now_ms.div_euclid(policy.window_ms) * policy.window_ms;
        let prune_before = now_ms - RETENTION_WINDOWS * policy.window_ms;

        let count = {
            let mut db = self.db.lock().await;
            match db.increment_rate_window(key, window_start, prune_before) {
                Ok(count) => count,
                Err(e) => {
                    // Fail open: availability beats limiting when the store
                    // is down.
                    tracing::warn!(key, error = %e, "rate limiter store failure, admitting request");
                    return Ok(full_window(policy, window_start));
                }
            }
        };

        if count > policy.max_requests {
            let retry_after_ms = if policy.exponential_backoff {
                backoff_ms(policy, count)
            } else {
                window_start + policy.window_ms - now_ms
            };
            let retry_after_secs = (retry_after_ms.max(0) as u64).div_ceil(1000);

            tracing::warn!(key, count, retry_after_secs, "rate limit exceeded");
            return Err(ApiError::RateLimited { retry_after_secs });
        }

        let decision = RateLimitDecision {
            remaining: policy.max_requests - count,
            reset_at: reset_at(policy, window_start),
            limit: policy.max_requests,
        };
        tracing::trace!(
            key,
            remaining = decision.remaining,
            limit = decision.limit,
            reset_at = %decision.reset_at,
            "rate limit check passed"
        );
        Ok(decision)
    }
}

fn reset_at(policy: &RateLimitPolicy, window_start: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(window_start + policy.window_ms)
        .unwrap_or_else(Utc::now)
}

fn full_window(policy: &RateLimitPolicy, window_start: i64) -> RateLimitDecision {
    RateLimitDecision {
        remaining: policy.max_requests,
        reset_at: reset_at(policy, window_start),
        limit: policy.max_requests,
    }
}

/// `window_ms * 2^((count - max) / 10)`, capped by the policy.
fn backoff_ms(policy: &RateLimitPolicy, count: u64) -> i64 {
    let over = count.saturating_sub(policy.max_requests);
    let exponent = (over / 10).min(30) as u32;
    policy
        .window_ms
        .saturating_mul(1i64 << exponent)
        .min(policy.max_backoff_ms)
}

// ─── Client IP extraction ───

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

impl ClientIp {
    /// Principal string for IP-keyed rate limits and audit rows.
    pub fn key(&self) -> String {
        self.0.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Infallible> {
        if let Some(connect_info) = parts.extensions.get::<ConnectInfo<std::net::SocketAddr>>() {
            return Ok(ClientIp(Some(connect_info.0.ip())));
        }

        if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
            if let Ok(value) = forwarded.to_str() {
                if let Some(first) = value.split(',').next() {
                    if let Ok(ip) = first.trim().parse::<IpAddr>() {
                        return Ok(ClientIp(Some(ip)));
                    }
                }
            }
        }

        if let Some(real_ip) = parts.headers.get("x-real-ip") {
            if let Ok(value) = real_ip.to_str() {
                if let Ok(ip) = value.trim().parse::<IpAddr>() {
                    return Ok(ClientIp(Some(ip)));
                }
            }
        }

        Ok(ClientIp(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(Mutex::new(Database::open_in_memory().unwrap())))
    }

    const TEST_POLICY: RateLimitPolicy = RateLimitPolicy {
        max_requests: 3,
        window_ms: 60_000,
        exponential_backoff: true,
        max_backoff_ms: 300_000,
    };

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let limiter = limiter();
        let now = 1_700_000_000_000;

        for i in 0..3 {
            let decision = limiter.check_at("k", &TEST_POLICY, now).await.unwrap();
            assert_eq!(decision.remaining, 2 - i);
            assert_eq!(decision.limit, 3);
        }

        let err = limiter.check_at("k", &TEST_POLICY, now).await.unwrap_err();
        match err {
            ApiError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 60),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn next_window_admits_again() {
        let limiter = limiter();
        let now = 1_700_000_000_000;

        for _ in 0..4 {
            let _ = limiter.check_at("k", &TEST_POLICY, now).await;
        }
        assert!(limiter.check_at("k", &TEST_POLICY, now).await.is_err());

        let later = now + TEST_POLICY.window_ms;
        assert!(limiter.check_at("k", &TEST_POLICY, later).await.is_ok());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = limiter();
        let now = 1_700_000_000_000;

        for _ in 0..4 {
            let _ = limiter.check_at("login:1.2.3.4", &TEST_POLICY, now).await;
        }
        assert!(limiter
            .check_at("login:1.2.3.4", &TEST_POLICY, now)
            .await
            .is_err());
        assert!(limiter
            .check_at("login:5.6.7.8", &TEST_POLICY, now)
            .await
            .is_ok());
    }

    #[test]
    fn backoff_doubles_every_ten_over() {
        // One over the limit: plain window.
        assert_eq!(backoff_ms(&TEST_POLICY, 4), 60_000);
        assert_eq!(backoff_ms(&TEST_POLICY, 12), 60_000);
        // Ten over: doubled.
        assert_eq!(backoff_ms(&TEST_POLICY, 13), 120_000);
        // Twenty over: doubled again.
        assert_eq!(backoff_ms(&TEST_POLICY, 23), 240_000);
        // Capped.
        assert_eq!(backoff_ms(&TEST_POLICY, 1000), 300_000);
    }

    #[test]
    fn login_policy_matches_contract() {
        assert_eq!(LOGIN_POLICY.max_requests, 10);
        assert_eq!(LOGIN_POLICY.window_ms, 60_000);
        assert_eq!(LOGIN_POLICY.max_backoff_ms, 300_000);
        assert_eq!(TOTP_POLICY.max_requests, 5);
        assert_eq!(DISPATCH_POLICY.max_requests, 60);
        assert_eq!(VAULT_COMPLETE_POLICY.max_requests, 30);
    }
}
