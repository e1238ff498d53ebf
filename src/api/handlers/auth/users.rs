//! Password changes for the signed-in user.

use axum::{
    extract::Extension,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use super::guard::{require_auth, Identity};
use super::session::clear_auth_cookies;
use super::storage::{CredentialStore, PgCredentialStore, PgSessionStore, SessionStore};
use super::types::UpdatePasswordRequest;
use super::utils::{hash_password, verify_password};
use crate::api::error::ApiError;
use crate::api::handlers::auth::AuthState;

const MIN_PASSWORD_LENGTH: usize = 8;

#[utoipa::path(
    patch,
    path = "/v1/users/password",
    request_body = UpdatePasswordRequest,
    responses(
        (status = 204, description = "Password updated; every session revoked"),
        (status = 401, description = "Not signed in or current password incorrect"),
        (status = 400, description = "New password too weak")
    ),
    tag = "users"
)]
pub async fn update_password(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    Json(request): Json<UpdatePasswordRequest>,
) -> Response {
    let sessions = PgSessionStore::new(pool.0.clone());
    let auth = match require_auth(&auth_state.0, &sessions, &headers).await {
        Ok(auth) => auth,
        Err(response) => return response,
    };

    let users = PgCredentialStore::new(pool.0.clone());
    match change_password(&users, &sessions, &auth.identity, &request).await {
        Ok(()) => {
            // Every session is gone, this device's included; the client must
            // sign in again.
            let mut response_headers = HeaderMap::new();
            for cookie in clear_auth_cookies() {
                response_headers.append(SET_COOKIE, cookie);
            }
            (StatusCode::NO_CONTENT, response_headers).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn change_password(
    users: &dyn CredentialStore,
    sessions: &dyn SessionStore,
    identity: &Identity,
    request: &UpdatePasswordRequest,
) -> Result<(), ApiError> {
    if request.new_password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    let user = users
        .find_by_id(identity.user_id)
        .await?
        .ok_or_else(|| ApiError::Authentication("Account no longer exists".to_string()))?;

    // A valid cookie is not enough to change credentials.
    if !verify_password(&request.current_password, &user.password_hash) {
        return Err(ApiError::Authentication(
            "Current password is incorrect".to_string(),
        ));
    }

    let password_hash = hash_password(&request.new_password)?;
    users.update_password(user.id, &password_hash).await?;

    let revoked = sessions.delete_all_for_user(user.id).await?;
    info!(user_id = %user.id, revoked, "Password changed, sessions revoked");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::guard::DeviceSignature;
    use crate::api::handlers::auth::storage::UserRecord;
    use crate::api::handlers::auth::types::Role;
    use crate::api::test_support::{MemoryCredentialStore, MemorySessionStore};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn seeded_stores(password: &str) -> (MemoryCredentialStore, MemorySessionStore, Identity) {
        let users = MemoryCredentialStore::new();
        let id = Uuid::new_v4();
        users.insert_user(UserRecord {
            id,
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            phone_number: "+123".to_string(),
            password_hash: hash_password(password).unwrap(),
            role: Role::Customer,
        });

        let sessions = MemorySessionStore::new();
        for token_hash in [vec![1u8; 32], vec![2u8; 32]] {
            sessions.insert_owner(
                token_hash,
                id,
                Role::Customer,
                "ada@example.com",
                "Ada",
                DeviceSignature {
                    user_agent: "firefox".to_string(),
                    ip_address: "1.2.3.4".to_string(),
                },
                Utc::now() + Duration::days(30),
            );
        }

        let identity = Identity {
            user_id: id,
            role: Role::Customer,
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
        };
        (users, sessions, identity)
    }

    fn request(current: &str, new: &str) -> UpdatePasswordRequest {
        UpdatePasswordRequest {
            current_password: current.to_string(),
            new_password: new.to_string(),
        }
    }

    #[tokio::test]
    async fn change_password_rehashes_and_revokes_every_session() {
        let (users, sessions, identity) = seeded_stores("old-password");

        change_password(
            &users,
            &sessions,
            &identity,
            &request("old-password", "new-password"),
        )
        .await
        .unwrap();

        let user = users.find_by_id(identity.user_id).await.unwrap().unwrap();
        assert!(verify_password("new-password", &user.password_hash));
        assert!(!verify_password("old-password", &user.password_hash));
        assert_eq!(sessions.session_count(), 0);
    }

    #[tokio::test]
    async fn wrong_current_password_changes_nothing() {
        let (users, sessions, identity) = seeded_stores("old-password");

        let err = change_password(
            &users,
            &sessions,
            &identity,
            &request("not-the-password", "new-password"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::Authentication(_)));
        let user = users.find_by_id(identity.user_id).await.unwrap().unwrap();
        assert!(verify_password("old-password", &user.password_hash));
        assert_eq!(sessions.session_count(), 2);
    }

    #[tokio::test]
    async fn short_new_password_is_rejected_before_any_lookup() {
        let (users, sessions, identity) = seeded_stores("old-password");

        let err = change_password(&users, &sessions, &identity, &request("old-password", "short"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(sessions.session_count(), 2);
    }
}
