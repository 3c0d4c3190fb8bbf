//! Session cookie handling and the authenticated-user extractor.
//!
//! The cookie carries a signed session token; the extractor additionally
//! checks the session row in the store so logout revokes access before the
//! token itself expires.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;

use peanut_shared::constants::{SESSION_COOKIE, SESSION_TTL_SECS};
use peanut_store::Role;

use crate::api::AppState;
use crate::error::ApiError;

/// Authenticated principal resolved from the session cookie.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub session_id: String,
    pub totp_verified: bool,
}

impl CurrentUser {
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.role != Role::Admin {
            return Err(ApiError::Forbidden("Admin role required".into()));
        }
        Ok(())
    }

    pub fn require_operator(&self) -> Result<(), ApiError> {
        if self.role != Role::Admin && self.role != Role::Operator {
            return Err(ApiError::Forbidden("Operator role required".into()));
        }
        Ok(())
    }
}

fn unauthorized() -> ApiError {
    ApiError::Unauthorized("Authentication required".into())
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(unauthorized)?;

        let claims = state
            .tokens
            .validate_session(&token)
            .map_err(|_| unauthorized())?;
        let role = Role::parse(&claims.role).ok_or_else(unauthorized)?;

        let session = {
            let db = state.db.lock().await;
            db.get_session(&claims.sid).map_err(|_| unauthorized())?
        };
        if !session.is_live(Utc::now()) {
            return Err(unauthorized());
        }

        Ok(CurrentUser {
            user_id: claims.sub,
            email: claims.email,
            role,
            session_id: claims.sid,
            totp_verified: claims.totp_verified,
        })
    }
}

/// Build the session cookie: http-only, same-site strict, secure in
/// production, 8 h lifetime.
pub fn session_cookie(token: String, production: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, token);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(production);
    cookie.set_max_age(time::Duration::seconds(SESSION_TTL_SECS));
    cookie
}

/// Expired replacement cookie, used by logout.
pub fn clear_session_cookie(production: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE, "");
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(production);
    cookie.set_max_age(time::Duration::ZERO);
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_attributes() {
        let cookie = session_cookie("tok".into(), true);
        assert_eq!(cookie.name(), SESSION_COOKIE);
        assert_eq!(cookie.value(), "tok");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
        assert_eq!(cookie.secure(), Some(true));
    }

    #[test]
    fn dev_cookie_is_not_secure() {
        let cookie = session_cookie("tok".into(), false);
        assert_eq!(cookie.secure(), Some(false));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let cookie = clear_session_cookie(false);
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
    }
}
