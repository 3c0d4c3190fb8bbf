//! Session and intermediate token issuance and validation.
//!
//! Both token kinds are HS256 JWTs signed with the gateway session secret.
//! The intermediate token is minted after a correct password when TOTP is
//! enabled; it is only ever accepted by the TOTP verification endpoint and
//! carries a distinct `token_type` so the two can never be confused.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::constants::{INTERMEDIATE_TTL_SECS, SESSION_TTL_SECS};
use crate::crypto::random_id;

const TYPE_SESSION: &str = "session";
const TYPE_TOTP: &str = "totp";

/// Claims embedded in a session token (8 h lifetime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user id).
    pub sub: String,
    /// Account email, for display and audit attribution.
    pub email: String,
    /// Role name: "admin", "operator" or "viewer".
    pub role: String,
    /// Whether this session passed TOTP verification.
    pub totp_verified: bool,
    /// Session row id in the store.
    pub sid: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
    /// Always "session".
    pub token_type: String,
}

/// Claims embedded in an intermediate (TOTP-pending) token (10 min lifetime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateClaims {
    /// Subject (user id).
    pub sub: String,
    /// One-shot nonce, unique per login attempt.
    pub nonce: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
    /// Always "totp".
    pub token_type: String,
}

/// Signs and validates both token kinds.
#[derive(Clone)]
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenManager {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Issue a session token. Returns the token and its expiry timestamp.
    pub fn issue_session(
        &self,
        user_id: &str,
        email: &str,
        role: &str,
        totp_verified: bool,
        session_id: &str,
    ) -> Result<(String, i64), jsonwebtoken::errors::Error> {
        let now = now_secs();
        let exp = now + SESSION_TTL_SECS;

        let claims = SessionClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            totp_verified,
            sid: session_id.to_string(),
            iat: now,
            exp,
            token_type: TYPE_SESSION.to_string(),
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok((token, exp))
    }

    /// Issue an intermediate token for a user who still owes a TOTP code.
    pub fn issue_intermediate(
        &self,
        user_id: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = now_secs();

        let claims = IntermediateClaims {
            sub: user_id.to_string(),
            nonce: random_id(),
            iat: now,
            exp: now + INTERMEDIATE_TTL_SECS,
            token_type: TYPE_TOTP.to_string(),
        };

        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Validate a session token; rejects intermediate tokens.
    pub fn validate_session(
        &self,
        token: &str,
    ) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<SessionClaims>(
            token,
            &self.decoding_key,
            &Validation::default(),
        )?;
        if data.claims.token_type != TYPE_SESSION {
            return Err(ErrorKind::InvalidToken.into());
        }
        Ok(data.claims)
    }

    /// Validate an intermediate token; rejects session tokens.
    pub fn validate_intermediate(
        &self,
        token: &str,
    ) -> Result<IntermediateClaims, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<IntermediateClaims>(
            token,
            &self.decoding_key,
            &Validation::default(),
        )?;
        if data.claims.token_type != TYPE_TOTP {
            return Err(ErrorKind::InvalidToken.into());
        }
        Ok(data.claims)
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
