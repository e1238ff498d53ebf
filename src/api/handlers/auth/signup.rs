//! Account creation.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sqlx::PgPool;
use tracing::{error, info};

use super::storage::{CreateUserOutcome, CredentialStore, NewUser, PgCredentialStore};
use super::types::{SignupRequest, UserResponse};
use super::utils::{hash_password, normalize_email, valid_email};
use crate::api::email;
use crate::api::error::{ApiError, ApiResult};
use crate::api::handlers::success;

const MIN_PASSWORD_LENGTH: usize = 8;

fn validate(request: &SignupRequest) -> Result<String, ApiError> {
    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(ApiError::Validation("Invalid email address".to_string()));
    }
    if request.first_name.trim().is_empty() || request.last_name.trim().is_empty() {
        return Err(ApiError::Validation("Name fields are required".to_string()));
    }
    if request.password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    if request.password != request.password_confirm {
        return Err(ApiError::Validation("Passwords do not match".to_string()));
    }
    Ok(email)
}

#[utoipa::path(
    post,
    path = "/v1/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "Account created", body = UserResponse),
        (status = 400, description = "Invalid input or email already registered")
    ),
    tag = "auth"
)]
pub async fn signup(
    pool: Extension<PgPool>,
    Json(request): Json<SignupRequest>,
) -> ApiResult<Response> {
    let email = validate(&request)?;
    let password_hash = hash_password(&request.password)?;

    let users = PgCredentialStore::new(pool.0.clone());
    let user = match users
        .create(NewUser {
            email,
            first_name: request.first_name.trim().to_string(),
            last_name: request.last_name.trim().to_string(),
            phone_number: request.phone_number.trim().to_string(),
            password_hash,
        })
        .await?
    {
        CreateUserOutcome::Created(user) => user,
        CreateUserOutcome::EmailTaken => {
            return Err(ApiError::Validation(
                "Email address is already registered".to_string(),
            ));
        }
    };

    info!(user_id = %user.id, "New account created");

    // The welcome email rides the outbox; a full queue must not fail signup.
    let payload = serde_json::json!({ "firstName": user.first_name });
    if let Err(err) = email::submit(
        &pool.0,
        &user.email,
        "welcome",
        &payload,
        email::JobOptions::new(),
    )
    .await
    {
        error!("Failed to enqueue welcome email: {err:#}");
    }

    let body = success(serde_json::json!({
        "user": UserResponse {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            role: user.role,
        }
    }));

    Ok((StatusCode::CREATED, Json(body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SignupRequest {
        SignupRequest {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "Ada@Example.com".to_string(),
            phone_number: "+123456".to_string(),
            password: "hunter2hunter2".to_string(),
            password_confirm: "hunter2hunter2".to_string(),
        }
    }

    #[test]
    fn validate_normalizes_email() {
        assert_eq!(validate(&request()).unwrap(), "ada@example.com");
    }

    #[test]
    fn validate_rejects_bad_email() {
        let mut bad = request();
        bad.email = "not-an-email".to_string();
        assert!(matches!(validate(&bad), Err(ApiError::Validation(_))));
    }

    #[test]
    fn validate_rejects_short_password() {
        let mut bad = request();
        bad.password = "short".to_string();
        bad.password_confirm = "short".to_string();
        assert!(matches!(validate(&bad), Err(ApiError::Validation(_))));
    }

    #[test]
    fn validate_rejects_mismatched_confirmation() {
        let mut bad = request();
        bad.password_confirm = "different-password".to_string();
        assert!(matches!(validate(&bad), Err(ApiError::Validation(_))));
    }

    #[test]
    fn validate_rejects_blank_names() {
        let mut bad = request();
        bad.first_name = "  ".to_string();
        assert!(matches!(validate(&bad), Err(ApiError::Validation(_))));
    }
}
