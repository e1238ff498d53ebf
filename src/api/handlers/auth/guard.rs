//! Per-request authentication decisions.
//!
//! The guard is an explicit decision function, not middleware: handlers call
//! [`require_auth`], which evaluates the cookie pair against the token
//! service and the session store and returns either an identity (plus a
//! rotated access cookie when the refresh path was taken) or a rejection
//! response with both cookies cleared.
//!
//! Every rejection path clears both cookies, and any implicated session row
//! is deleted in the same pass, so a session is never left usable without
//! being revocable or the other way around. Each request is evaluated fresh;
//! the guard performs no retries and caches nothing.

use anyhow::{Context, Result};
use axum::{
    http::{header::SET_COOKIE, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::{error, warn};
use uuid::Uuid;

use super::session::{access_cookie, clear_auth_cookies, cookie_value, ACCESS_COOKIE, REFRESH_COOKIE};
use super::state::AuthState;
use super::storage::SessionStore;
use super::types::Role;
use super::utils::{extract_client_ip, hash_refresh_token};
use crate::api::error::ApiError;

/// Weak binding between a session and the client using it: a device hint
/// (`x-device-id`, falling back to `user-agent`) plus the client IP. This is
/// best-effort compromise detection, not a cryptographic guarantee (both
/// values are spoofable), but a mismatch must still revoke the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSignature {
    pub user_agent: String,
    pub ip_address: String,
}

impl DeviceSignature {
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let user_agent = headers
            .get("x-device-id")
            .or_else(|| headers.get("user-agent"))
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let ip_address = extract_client_ip(headers).unwrap_or_default();
        Self {
            user_agent,
            ip_address,
        }
    }
}

/// Authenticated identity attached to the request context.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
    pub email: String,
    pub first_name: String,
}

/// Successful guard outcome. `rotated_access_cookie` is `Some` only when the
/// refresh path minted a new access token; the handler must append it to the
/// response.
#[derive(Debug)]
pub struct Authenticated {
    pub identity: Identity,
    pub rotated_access_cookie: Option<HeaderValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    /// Neither cookie was presented.
    NotLoggedIn,
    /// Access invalid and the refresh token could not be redeemed.
    SessionExpired,
    /// Device signature mismatch; the session row has been deleted.
    SessionCompromised,
}

/// A guard rejection; turns into a 401 with both cookies cleared.
#[derive(Debug)]
pub struct Rejection {
    pub reason: RejectionReason,
}

impl Rejection {
    /// The taxonomy error this rejection answers with; status and message
    /// both come from [`ApiError`] so the two can never drift apart.
    fn as_api_error(&self) -> ApiError {
        match self.reason {
            RejectionReason::NotLoggedIn => {
                ApiError::Authentication("You are not logged in".to_string())
            }
            RejectionReason::SessionExpired => {
                ApiError::Authentication("Session expired. Please log in again.".to_string())
            }
            RejectionReason::SessionCompromised => ApiError::SessionCompromised,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let mut response = self.as_api_error().into_response();
        for cookie in clear_auth_cookies() {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        response
    }
}

#[derive(Debug)]
pub enum GuardOutcome {
    Authenticated(Authenticated),
    Rejected(Rejection),
}

fn rejected(reason: RejectionReason) -> Result<GuardOutcome> {
    Ok(GuardOutcome::Rejected(Rejection { reason }))
}

/// Evaluate the guard state machine for one request.
///
/// Store failures propagate as errors; everything expected becomes either
/// `Authenticated` or a `Rejected` with the session cleanup already done.
pub async fn authenticate(
    state: &AuthState,
    sessions: &dyn SessionStore,
    headers: &HeaderMap,
    device: &DeviceSignature,
    now: DateTime<Utc>,
) -> Result<GuardOutcome> {
    let access = cookie_value(headers, ACCESS_COOKIE);
    let refresh = cookie_value(headers, REFRESH_COOKIE);

    // 1. Nothing presented at all.
    if access.is_none() && refresh.is_none() {
        return rejected(RejectionReason::NotLoggedIn);
    }

    // 2. A valid access token is terminal success: no reads, no writes.
    if let Some(token) = &access {
        if let Some(claims) = state.tokens().verify_access(token) {
            return Ok(GuardOutcome::Authenticated(Authenticated {
                identity: Identity {
                    user_id: claims.id,
                    role: claims.role,
                    email: claims.email,
                    first_name: claims.first_name,
                },
                rotated_access_cookie: None,
            }));
        }
    }

    // 3. Access missing or invalid and nothing to refresh with.
    let Some(refresh_token) = refresh else {
        return rejected(RejectionReason::SessionExpired);
    };

    let token_hash = hash_refresh_token(&refresh_token);

    // 4. Refresh fails signature/lifetime checks: drop any matching row.
    if state.tokens().verify_refresh(&refresh_token).is_none() {
        sessions
            .delete_by_token_hash(&token_hash)
            .await
            .context("failed to delete session for invalid refresh token")?;
        return rejected(RejectionReason::SessionExpired);
    }

    // 5. Refresh verifies but must also be backed by a live session row.
    let Some(owner) = sessions
        .find_by_token_hash(&token_hash)
        .await
        .context("failed to lookup refresh session")?
    else {
        return rejected(RejectionReason::SessionExpired);
    };

    if owner.session.expires_at <= now {
        sessions
            .delete_by_token_hash(&token_hash)
            .await
            .context("failed to delete expired session")?;
        return rejected(RejectionReason::SessionExpired);
    }

    // 6. Device binding. Best-effort, but a mismatch always revokes.
    if owner.session.user_agent != device.user_agent
        || owner.session.ip_address != device.ip_address
    {
        sessions
            .delete_by_token_hash(&token_hash)
            .await
            .context("failed to delete compromised session")?;
        warn!(
            user_id = %owner.session.user_id,
            "refresh token presented from a different device signature"
        );
        return rejected(RejectionReason::SessionCompromised);
    }

    // 7. Rotate: mint a fresh access token; the session row stays untouched.
    let access_token = state.tokens().issue_access(
        owner.session.user_id,
        owner.role,
        &owner.email,
        &owner.first_name,
        now,
    )?;
    let cookie = access_cookie(state.config(), &access_token)
        .context("failed to build rotated access cookie")?;

    Ok(GuardOutcome::Authenticated(Authenticated {
        identity: Identity {
            user_id: owner.session.user_id,
            role: owner.role,
            email: owner.email,
            first_name: owner.first_name,
        },
        rotated_access_cookie: Some(cookie),
    }))
}

/// Handler-facing wrapper: run the guard and turn failures into ready-made
/// responses so call sites stay a two-line match.
pub async fn require_auth(
    state: &AuthState,
    sessions: &dyn SessionStore,
    headers: &HeaderMap,
) -> Result<Authenticated, Response> {
    let device = DeviceSignature::from_headers(headers);
    match authenticate(state, sessions, headers, &device, Utc::now()).await {
        Ok(GuardOutcome::Authenticated(auth)) => Ok(auth),
        Ok(GuardOutcome::Rejected(rejection)) => Err(rejection.into_response()),
        Err(err) => {
            error!("Auth guard failed: {err:#}");
            Err(ApiError::Internal(err).into_response())
        }
    }
}

/// Role check for handlers that need more than a valid identity.
pub fn require_role(identity: &Identity, role: Role) -> Result<(), ApiError> {
    if identity.role == role {
        Ok(())
    } else {
        Err(ApiError::Authorization(
            "You do not have permission to perform this action".to_string(),
        ))
    }
}
