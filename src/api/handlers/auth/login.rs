//! Credential verification and session creation.

use anyhow::{anyhow, Context};
use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use super::guard::DeviceSignature;
use super::session::{access_cookie, refresh_cookie};
use super::storage::{
    CredentialStore, PgCredentialStore, PgSessionStore, SessionRecord, SessionStore, UserRecord,
};
use super::types::{LoginRequest, UserResponse};
use super::utils::{hash_refresh_token, normalize_email, verify_password};
use crate::api::error::{ApiError, ApiResult};
use crate::api::handlers::auth::AuthState;
use crate::api::handlers::success;

#[derive(Debug)]
pub(crate) struct SignIn {
    pub user: UserRecord,
    pub access_token: String,
    pub refresh_token: String,
}

/// Verify credentials and persist exactly one session row bound to the
/// device signature observed at sign-in. Store-agnostic so the sequence can
/// be exercised against the in-memory doubles.
pub(crate) async fn sign_in(
    users: &dyn CredentialStore,
    sessions: &dyn SessionStore,
    state: &AuthState,
    device: DeviceSignature,
    request: &LoginRequest,
    now: DateTime<Utc>,
) -> Result<SignIn, ApiError> {
    let email = normalize_email(&request.email);

    // One message for both unknown email and wrong password.
    let invalid = || ApiError::Authentication("Incorrect email or password".to_string());
    let user = users.find_by_email(&email).await?.ok_or_else(invalid)?;
    if !verify_password(&request.password, &user.password_hash) {
        return Err(invalid());
    }

    let access_token = state
        .tokens()
        .issue_access(user.id, user.role, &user.email, &user.first_name, now)?;
    let refresh_token = state.tokens().issue_refresh(user.id, now)?;

    sessions
        .create(SessionRecord {
            token_hash: hash_refresh_token(&refresh_token),
            user_id: user.id,
            user_agent: device.user_agent,
            ip_address: device.ip_address,
            expires_at: now + Duration::seconds(state.config().refresh_ttl_seconds()),
        })
        .await
        .context("failed to persist refresh session")?;

    Ok(SignIn {
        user,
        access_token,
        refresh_token,
    })
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in; auth cookies set", body = UserResponse),
        (status = 401, description = "Incorrect email or password")
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Response> {
    let users = PgCredentialStore::new(pool.0.clone());
    let sessions = PgSessionStore::new(pool.0.clone());
    let device = DeviceSignature::from_headers(&headers);
    let state = &auth_state.0;

    let signed_in = sign_in(&users, &sessions, state, device, &request, Utc::now()).await?;
    let user = signed_in.user;

    info!(user_id = %user.id, "User signed in");

    let mut response_headers = HeaderMap::new();
    response_headers.append(
        SET_COOKIE,
        access_cookie(state.config(), &signed_in.access_token)
            .map_err(|err| anyhow!("failed to build access cookie: {err}"))?,
    );
    response_headers.append(
        SET_COOKIE,
        refresh_cookie(state.config(), &signed_in.refresh_token)
            .map_err(|err| anyhow!("failed to build refresh cookie: {err}"))?,
    );

    let body = success(serde_json::json!({
        "user": UserResponse {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            role: user.role,
        }
    }));

    Ok((StatusCode::OK, response_headers, Json(body)).into_response())
}
