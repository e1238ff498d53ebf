//! Route handlers and the response envelope they share.

pub mod auth;
pub mod cart;
pub mod health;
pub mod orders;
pub mod products;
pub mod root;

use axum::http::{header::SET_COOKIE, HeaderValue};
use axum::response::Response;
use serde_json::json;

/// Success envelope used by every 2xx JSON response.
pub(crate) fn success(data: serde_json::Value) -> serde_json::Value {
    json!({
        "status": "success",
        "data": data,
    })
}

/// Append the rotated access cookie the guard may have minted. Handlers call
/// this on every guarded response so transparent rotation actually reaches
/// the client.
pub(crate) fn with_rotated_cookie(mut response: Response, cookie: Option<HeaderValue>) -> Response {
    if let Some(cookie) = cookie {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn success_envelope_shape() {
        let body = success(json!({"user": {"id": 1}}));
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["user"]["id"], 1);
    }

    #[test]
    fn rotated_cookie_is_appended() {
        let response = ().into_response();
        let response = with_rotated_cookie(
            response,
            Some(HeaderValue::from_static("access-token=abc; Path=/")),
        );
        assert!(response.headers().get(SET_COOKIE).is_some());

        let untouched = with_rotated_cookie(().into_response(), None);
        assert!(untouched.headers().get(SET_COOKIE).is_none());
    }
}
