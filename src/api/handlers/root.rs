use axum::{http::StatusCode, response::IntoResponse};

// Undocumented liveness route; load balancers hit this.
pub async fn root() -> impl IntoResponse {
    StatusCode::OK
}
