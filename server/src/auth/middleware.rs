//! Authentication extractor.
//!
//! Clients send `Authorization: Bearer <token>` and `X-Actor-Id: <user id>`.
//! When `AUTH_SECRET` is configured the token must match it; otherwise any
//! well-formed request is accepted.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use crate::error::AppError;
use crate::AppState;

/// Header naming the user a change is attributed to.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Authenticated caller extracted from request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthUser {
    /// User the request acts for
    pub actor: Option<String>,
}

impl AuthUser {
    /// Check `headers` against the configured secret.
    pub fn authenticate(headers: &HeaderMap, secret: Option<&str>) -> Result<Self, AppError> {
        let token = match headers.get(AUTHORIZATION) {
            None => None,
            Some(value) => {
                let header = value
                    .to_str()
                    .map_err(|_| AppError::Unauthorized("invalid authorization header"))?;
                let token = header
                    .strip_prefix("Bearer ")
                    .ok_or(AppError::Unauthorized("invalid authorization header format"))?
                    .trim();
                if token.is_empty() {
                    return Err(AppError::Unauthorized("empty bearer token"));
                }
                Some(token.to_string())
            }
        };

        if let Some(secret) = secret {
            match token.as_deref() {
                None => return Err(AppError::Unauthorized("missing authorization header")),
                Some(token) if token != secret => {
                    return Err(AppError::Unauthorized("invalid bearer token"))
                }
                Some(_) => {}
            }
        }

        let actor = headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|actor| !actor.is_empty())
            .map(str::to_string);

        Ok(AuthUser { actor })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        AuthUser::authenticate(&parts.headers, state.config.auth_secret.as_deref())
    }
}
