//! Authentication: login state machine, TOTP enrolment and verification,
//! session establishment, password changes, and the initial admin seed.
//!
//! Failure responses are deliberately uniform. A wrong password, an unknown
//! email, an expired intermediate token and a reused backup code all read
//! the same from outside; the audit log carries the specifics.

use axum::extract::State;
use axum::Json;
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use peanut_shared::constants::{MIN_PASSWORD_LEN, SESSION_TTL_SECS};
use peanut_shared::crypto::random_id;
use peanut_shared::password::{hash_password, verify_password};
use peanut_shared::totp;
use peanut_store::{Role, Session, User};

use crate::api::AppState;
use crate::audit::AuditActor;
use crate::error::ApiError;
use crate::rate_limit::{ClientIp, LOGIN_POLICY, TOTP_POLICY};
use crate::session::{clear_session_cookie, session_cookie, CurrentUser};

/// Email (and display name) of the seeded administrator account.
pub const SEED_ADMIN_EMAIL: &str = "admin@peanut.local";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub require_totp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TotpVerifyRequest {
    pub temp_token: String,
    pub totp_code: String,
}

#[derive(Debug, Serialize)]
pub struct TotpSetupResponse {
    pub secret: String,
    pub qr_code_data_url: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub role: Role,
    pub totp_enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub last_login_at: Option<chrono::DateTime<Utc>>,
}

fn invalid_credentials() -> ApiError {
    ApiError::Unauthorized("Invalid email or password".into())
}

fn totp_failed() -> ApiError {
    ApiError::Unauthorized("TOTP verification failed".into())
}

/// Mint a session row and its cookie for an authenticated user, record the
/// login, and append the `auth.login` entry.
async fn establish_session(
    state: &AppState,
    user: &User,
    totp_verified: bool,
    method: &str,
    used_backup: bool,
    ip: &ClientIp,
) -> Result<axum_extra::extract::cookie::Cookie<'static>, ApiError> {
    let now = Utc::now();
    let session = Session {
        id: random_id(),
        user_id: user.id.clone(),
        created_at: now,
        expires_at: now + Duration::seconds(SESSION_TTL_SECS),
        revoked: false,
    };

    {
        let db = state.db.lock().await;
        if let Err(e) = db.delete_expired_sessions(now) {
            tracing::warn!(error = %e, "failed to purge expired sessions");
        }
        db.create_session(&session)?;
        db.update_user(&user.record_login(now))?;
    }

    let (token, _exp) = state
        .tokens
        .issue_session(
            &user.id,
            &user.email,
            user.role.as_str(),
            totp_verified,
            &session.id,
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut details = serde_json::Map::new();
    details.insert("method".into(), method.into());
    if method == "totp" {
        details.insert("used_backup".into(), used_backup.into());
    }
    state
        .audit
        .append(
            "auth.login",
            &AuditActor {
                user_id: Some(user.id.clone()),
                email: Some(user.email.clone()),
                ip: Some(ip.key()),
                user_agent: None,
            },
            Some("user"),
            Some(&user.id),
            details,
        )
        .await?;

    tracing::info!(user = %user.email, method, "login succeeded");
    Ok(session_cookie(token, state.config.production))
}

async fn audit_login_failure(state: &AppState, email: &str, ip: &ClientIp, reason: &str) {
    let mut details = serde_json::Map::new();
    details.insert("email".into(), email.into());
    details.insert("reason".into(), reason.into());

    let actor = AuditActor {
        user_id: None,
        email: Some(email.to_string()),
        ip: Some(ip.key()),
        user_agent: None,
    };
    if let Err(e) = state
        .audit
        .append("auth.login_failed", &actor, Some("user"), None, details)
        .await
    {
        tracing::error!(error = %e, "failed to audit login failure");
    }
}

/// POST /api/v1/auth/login (public)
pub async fn login(
    State(state): State<AppState>,
    ip: ClientIp,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    state
        .limiter
        .check(&format!("login:{}", ip.key()), &LOGIN_POLICY)
        .await?;

    let email = request.email.trim().to_lowercase();
    let user = {
        let db = state.db.lock().await;
        db.get_user_by_email(&email)
    };
    let user = match user {
        Ok(user) => user,
        Err(_) => {
            audit_login_failure(&state, &email, &ip, "unknown_email").await;
            return Err(invalid_credentials());
        }
    };

    if !verify_password(&request.password, &user.password_hash) {
        audit_login_failure(&state, &email, &ip, "bad_password").await;
        return Err(invalid_credentials());
    }

    if user.totp_enabled {
        let temp_token = state
            .tokens
            .issue_intermediate(&user.id)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Ok((
            jar,
            Json(LoginResponse {
                require_totp: true,
                temp_token: Some(temp_token),
            }),
        ));
    }

    let cookie = establish_session(&state, &user, false, "password", false, &ip).await?;
    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            require_totp: false,
            temp_token: None,
        }),
    ))
}

/// POST /api/v1/auth/totp/verify (public; accepts only intermediate tokens)
pub async fn totp_verify(
    State(state): State<AppState>,
    ip: ClientIp,
    jar: CookieJar,
    Json(request): Json<TotpVerifyRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    state
        .limiter
        .check(&format!("totp:{}", ip.key()), &TOTP_POLICY)
        .await?;

    let claims = state
        .tokens
        .validate_intermediate(&request.temp_token)
        .map_err(|_| totp_failed())?;

    let user = {
        let db = state.db.lock().await;
        db.get_user(&claims.sub).map_err(|_| totp_failed())?
    };

    let now = Utc::now();
    let code = request.totp_code.trim();

    let (user, used_backup) = if code.len() == 6 {
        let secret = user.totp_secret.as_deref().ok_or_else(totp_failed)?;
        if !totp::verify_code(secret, code, now.timestamp() as u64) {
            audit_login_failure(&state, &user.email, &ip, "bad_totp_code").await;
            return Err(totp_failed());
        }
        (user, false)
    } else if totp::looks_like_backup_code(code) {
        match user.use_backup_code(code, now) {
            Some(updated) => {
                let db = state.db.lock().await;
                db.update_user(&updated)?;
                (updated, true)
            }
            None => {
                audit_login_failure(&state, &user.email, &ip, "bad_backup_code").await;
                return Err(totp_failed());
            }
        }
    } else {
        audit_login_failure(&state, &user.email, &ip, "malformed_code").await;
        return Err(totp_failed());
    };

    let cookie = establish_session(&state, &user, true, "totp", used_backup, &ip).await?;
    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            require_totp: false,
            temp_token: None,
        }),
    ))
}

/// POST /api/v1/auth/logout (any role)
pub async fn logout(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    jar: CookieJar,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    {
        let db = state.db.lock().await;
        db.revoke_session(&user.session_id)?;
    }

    state
        .audit
        .append(
            "auth.logout",
            &AuditActor::from_user(&user, Some(ip.key())),
            Some("user"),
            Some(&user.user_id),
            Default::default(),
        )
        .await?;

    Ok((
        jar.add(clear_session_cookie(state.config.production)),
        Json(serde_json::json!({ "logged_out": true })),
    ))
}

/// GET /api/v1/auth/me (any role)
pub async fn me(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<UserProfile>, ApiError> {
    let record = {
        let db = state.db.lock().await;
        db.get_user(&user.user_id)?
    };

    Ok(Json(UserProfile {
        id: record.id,
        email: record.email,
        display_name: record.display_name,
        role: record.role,
        totp_enabled: record.totp_enabled,
        created_at: record.created_at,
        last_login_at: record.last_login_at,
    }))
}

/// POST /api/v1/auth/totp/setup (any role)
///
/// Generates and persists a fresh secret plus ten one-shot backup codes;
/// TOTP is required at login from this call onward.
pub async fn totp_setup(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
) -> Result<Json<TotpSetupResponse>, ApiError> {
    let record = {
        let db = state.db.lock().await;
        db.get_user(&user.user_id)?
    };

    let secret = totp::generate_secret();
    let backup_codes = totp::generate_backup_codes();
    let uri = totp::otpauth_uri(&record.email, &secret);
    let qr_code_data_url =
        totp::qr_data_url(&uri).map_err(|e| ApiError::Internal(e.to_string()))?;

    let enrolled = record.enable_totp(secret.clone(), backup_codes.clone(), Utc::now());
    {
        let db = state.db.lock().await;
        db.update_user(&enrolled)?;
    }

    state
        .audit
        .append(
            "auth.totp_enabled",
            &AuditActor::from_user(&user, Some(ip.key())),
            Some("user"),
            Some(&user.user_id),
            Default::default(),
        )
        .await?;

    tracing::info!(user = %user.email, "TOTP enabled");
    Ok(Json(TotpSetupResponse {
        secret,
        qr_code_data_url,
        backup_codes,
    }))
}

/// POST /api/v1/auth/password (any role)
pub async fn change_password(
    State(state): State<AppState>,
    user: CurrentUser,
    ip: ClientIp,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.new_password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }

    let record = {
        let db = state.db.lock().await;
        db.get_user(&user.user_id)?
    };
    if !verify_password(&request.current_password, &record.password_hash) {
        return Err(ApiError::Unauthorized("Current password is incorrect".into()));
    }

    let hash = hash_password(&request.new_password)?;
    {
        let db = state.db.lock().await;
        db.update_user(&record.with_password_hash(hash, Utc::now()))?;
    }

    state
        .audit
        .append(
            "auth.password_changed",
            &AuditActor::from_user(&user, Some(ip.key())),
            Some("user"),
            Some(&user.user_id),
            Default::default(),
        )
        .await?;

    Ok(Json(serde_json::json!({ "changed": true })))
}

/// Create the initial administrator on an empty user table.
pub async fn seed_admin(state: &AppState, password: &str) -> Result<bool, ApiError> {
    {
        let db = state.db.lock().await;
        if db.count_users()? > 0 {
            return Ok(false);
        }
    }

    let now = Utc::now();
    let admin = User {
        id: random_id(),
        email: SEED_ADMIN_EMAIL.to_string(),
        display_name: "Administrator".to_string(),
        password_hash: hash_password(password)?,
        role: Role::Admin,
        totp_secret: None,
        totp_enabled: false,
        backup_codes: vec![],
        created_at: now,
        updated_at: now,
        last_login_at: None,
    };

    {
        let db = state.db.lock().await;
        db.create_user(&admin)?;
    }

    let mut details = serde_json::Map::new();
    details.insert("email".into(), SEED_ADMIN_EMAIL.into());
    details.insert("seeded".into(), true.into());
    state
        .audit
        .append(
            "user.created",
            &AuditActor::default(),
            Some("user"),
            Some(&admin.id),
            details,
        )
        .await?;

    tracing::info!(email = SEED_ADMIN_EMAIL, "seeded initial admin user");
    Ok(true)
}
