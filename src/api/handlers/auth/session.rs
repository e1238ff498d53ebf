//! Auth cookies and the logout endpoint.
//!
//! Both tokens travel as `HttpOnly; Secure; SameSite=None` cookies. Each
//! cookie's `Max-Age` is derived from the same configuration field as the
//! token's `exp`, so cookie and token lifetimes are equal by construction.

use axum::{
    extract::Extension,
    http::{
        header::{InvalidHeaderValue, COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
};
use sqlx::PgPool;
use tracing::error;

use super::state::AuthConfig;
use super::storage::{PgSessionStore, SessionStore};
use super::utils::hash_refresh_token;

pub(crate) const ACCESS_COOKIE: &str = "access-token";
pub(crate) const REFRESH_COOKIE: &str = "refresh-token";

/// Read a cookie value from the request headers.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

fn auth_cookie(name: &str, token: &str, max_age: i64) -> Result<HeaderValue, InvalidHeaderValue> {
    // SameSite=None so the browser sends cookies on cross-site API calls
    // from the storefront; None requires Secure.
    let cookie =
        format!("{name}={token}; Path=/; HttpOnly; Secure; SameSite=None; Max-Age={max_age}");
    HeaderValue::from_str(&cookie)
}

/// Build the access-token cookie with lifetime equal to the token's.
pub(crate) fn access_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    auth_cookie(ACCESS_COOKIE, token, config.access_ttl_seconds())
}

/// Build the refresh-token cookie with lifetime equal to the token's.
pub(crate) fn refresh_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    auth_cookie(REFRESH_COOKIE, token, config.refresh_ttl_seconds())
}

/// Expired-cookie pair appended to every rejection so the client's next
/// request starts from a clean state.
pub(crate) fn clear_auth_cookies() -> [HeaderValue; 2] {
    [
        HeaderValue::from_static(
            "access-token=; Path=/; HttpOnly; Secure; SameSite=None; Max-Age=0",
        ),
        HeaderValue::from_static(
            "refresh-token=; Path=/; HttpOnly; Secure; SameSite=None; Max-Age=0",
        ),
    ]
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    if let Some(token) = cookie_value(&headers, REFRESH_COOKIE) {
        let sessions = PgSessionStore::new(pool.0.clone());
        let token_hash = hash_refresh_token(&token);
        // Logout is idempotent; a missing row is not an error.
        if let Err(err) = sessions.delete_by_token_hash(&token_hash).await {
            error!("Failed to delete session on logout: {err:#}");
        }
    }

    // Always clear both cookies, even if no session row existed.
    let mut response_headers = HeaderMap::new();
    for cookie in clear_auth_cookies() {
        response_headers.append(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> AuthConfig {
        AuthConfig::new(
            SecretString::from("access-secret".to_string()),
            SecretString::from("refresh-secret".to_string()),
            "https://shop.tld".to_string(),
        )
    }

    #[test]
    fn cookie_value_parses_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("access-token=abc; refresh-token=def"),
        );
        assert_eq!(
            cookie_value(&headers, ACCESS_COOKIE),
            Some("abc".to_string())
        );
        assert_eq!(
            cookie_value(&headers, REFRESH_COOKIE),
            Some("def".to_string())
        );
        assert_eq!(cookie_value(&headers, "other"), None);
    }

    #[test]
    fn cookie_value_ignores_empty_values() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("access-token="));
        assert_eq!(cookie_value(&headers, ACCESS_COOKIE), None);
    }

    #[test]
    fn access_cookie_max_age_matches_token_ttl() {
        let config = config().with_access_ttl_seconds(900);
        let cookie = access_cookie(&config, "tok").expect("cookie");
        let value = cookie.to_str().unwrap();
        assert!(value.starts_with("access-token=tok;"));
        assert!(value.contains("Max-Age=900"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
        assert!(value.contains("SameSite=None"));
    }

    #[test]
    fn refresh_cookie_max_age_matches_token_ttl() {
        let config = config();
        let cookie = refresh_cookie(&config, "tok").expect("cookie");
        let value = cookie.to_str().unwrap();
        assert!(value.contains(&format!("Max-Age={}", config.refresh_ttl_seconds())));
    }

    #[test]
    fn clear_cookies_expire_both_names() {
        let [access, refresh] = clear_auth_cookies();
        assert!(access.to_str().unwrap().contains("access-token=;"));
        assert!(access.to_str().unwrap().contains("Max-Age=0"));
        assert!(refresh.to_str().unwrap().contains("refresh-token=;"));
        assert!(refresh.to_str().unwrap().contains("Max-Age=0"));
    }
}
