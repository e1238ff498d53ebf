//! Idempotency keys for safely retryable mutations.
//!
//! A keyed operation runs at most once per key within the key's lifetime.
//! The first attempt claims the key, runs the operation, and snapshots the
//! exact HTTP response; any retry inside the window replays that snapshot
//! byte for byte without re-running side effects. The claim is a single
//! conditional upsert, so two concurrent first attempts cannot both win; the
//! loser observes either the stored response or an in-flight claim (409).
//!
//! A failed first attempt releases the claim, so clients can retry the same
//! key. Expired keys count as absent and are swept lazily by a background
//! task.

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::future::Future;
use tracing::error;
use uuid::Uuid;

use crate::api::error::ApiError;

pub(crate) mod storage;

pub use storage::{spawn_key_sweeper, PgIdempotencyStore};

/// Keys live for one hour from the first attempt.
pub const KEY_TTL_SECONDS: i64 = 60 * 60;

/// The mutations that accept an `idempotency-key` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdempotentAction {
    CartItemAdd,
    OrderPlacement,
}

impl IdempotentAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CartItemAdd => "cartItemAdd",
            Self::OrderPlacement => "orderPlacement",
        }
    }
}

/// Snapshot of a completed response, replayed verbatim on retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: String,
}

impl StoredResponse {
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            status: status.as_u16(),
            body: serde_json::to_string(body)?,
        })
    }

    #[must_use]
    pub fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        (status, [(CONTENT_TYPE, "application/json")], self.body).into_response()
    }
}

/// What the atomic claim observed.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This request owns the key and must run the operation.
    Claimed,
    /// A previous attempt finished; replay its response.
    Completed(StoredResponse),
    /// Another attempt holds the claim right now.
    InFlight,
}

/// Durable key store. The claim must be atomic: of N concurrent calls for
/// one absent key, exactly one sees `Claimed`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn claim(
        &self,
        key: &str,
        user_id: Uuid,
        action: IdempotentAction,
        now: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome>;

    /// Write-once; completing an already-completed key is a no-op.
    async fn complete(&self, key: &str, response: &StoredResponse) -> Result<()>;

    /// Drop an unresolved claim so the key becomes retryable.
    async fn release(&self, key: &str) -> Result<()>;

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

fn valid_nonce(nonce: &str) -> bool {
    Regex::new(r"^[A-Za-z0-9_-]{1,128}$").is_ok_and(|regex| regex.is_match(nonce))
}

/// Build the full key for an action. The client nonce comes from the
/// `idempotency-key` header; when absent, a server-generated UUID stands in,
/// which dedupes nothing across client retries but keeps the write path
/// uniform.
pub fn derive_key(
    action: IdempotentAction,
    user_id: Uuid,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    let nonce = match headers.get("idempotency-key") {
        Some(value) => {
            let value = value.to_str().map_err(|_| {
                ApiError::Validation("Invalid idempotency-key header".to_string())
            })?;
            if !valid_nonce(value) {
                return Err(ApiError::Validation(
                    "Invalid idempotency-key header".to_string(),
                ));
            }
            value.to_string()
        }
        None => Uuid::new_v4().to_string(),
    };
    Ok(format!("{}-{}-{}", action.as_str(), user_id, nonce))
}

/// Run `op` at most once for `key`.
///
/// The operation only runs after winning the claim. Success persists the
/// response snapshot; failure releases the claim and propagates the error, so
/// the same key can be retried. Replays and conflicts never execute `op`.
pub async fn execute<F, Fut>(
    store: &dyn IdempotencyStore,
    key: &str,
    user_id: Uuid,
    action: IdempotentAction,
    op: F,
) -> Result<StoredResponse, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse, ApiError>>,
{
    let now = Utc::now();
    match store
        .claim(key, user_id, action, now, KEY_TTL_SECONDS)
        .await?
    {
        ClaimOutcome::Completed(stored) => Ok(stored),
        ClaimOutcome::InFlight => Err(ApiError::Conflict(
            "A previous request with this idempotency key is still in progress".to_string(),
        )),
        ClaimOutcome::Claimed => match op().await {
            Ok(response) => {
                store.complete(key, &response).await?;
                Ok(response)
            }
            Err(err) => {
                // Release failures must not mask the operation's own error.
                if let Err(release_err) = store.release(key).await {
                    error!("Failed to release idempotency claim {key}: {release_err:#}");
                }
                Err(err)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::MemoryIdempotencyStore;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn user_id() -> Uuid {
        Uuid::parse_str("58a0a83d-9a3f-49a5-9c59-6bd874f0e508").unwrap()
    }

    #[test]
    fn nonce_validation() {
        assert!(valid_nonce("abc-DEF_123"));
        assert!(valid_nonce("x"));
        assert!(valid_nonce(&"a".repeat(128)));
        assert!(!valid_nonce(""));
        assert!(!valid_nonce(&"a".repeat(129)));
        assert!(!valid_nonce("has space"));
        assert!(!valid_nonce("semi;colon"));
    }

    #[test]
    fn derive_key_uses_client_nonce() {
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", HeaderValue::from_static("retry-42"));
        let key = derive_key(IdempotentAction::OrderPlacement, user_id(), &headers).unwrap();
        assert_eq!(key, format!("orderPlacement-{}-retry-42", user_id()));
    }

    #[test]
    fn derive_key_rejects_malformed_nonce() {
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", HeaderValue::from_static("bad key!"));
        let err = derive_key(IdempotentAction::CartItemAdd, user_id(), &headers).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn derive_key_generates_nonce_when_header_absent() {
        let first =
            derive_key(IdempotentAction::CartItemAdd, user_id(), &HeaderMap::new()).unwrap();
        let second =
            derive_key(IdempotentAction::CartItemAdd, user_id(), &HeaderMap::new()).unwrap();
        assert!(first.starts_with(&format!("cartItemAdd-{}-", user_id())));
        // Server nonces are unique, so absent headers never dedupe.
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn second_execution_replays_without_rerunning() {
        let store = MemoryIdempotencyStore::new();
        let executions = AtomicU32::new(0);

        let op = || async {
            executions.fetch_add(1, Ordering::SeqCst);
            StoredResponse::json(
                StatusCode::CREATED,
                &serde_json::json!({"status": "success", "data": {"orderId": 7}}),
            )
            .map_err(ApiError::Internal)
        };

        let first = execute(&store, "k1", user_id(), IdempotentAction::OrderPlacement, op)
            .await
            .unwrap();

        let op = || async {
            executions.fetch_add(1, Ordering::SeqCst);
            StoredResponse::json(StatusCode::CREATED, &serde_json::json!({"different": true}))
                .map_err(ApiError::Internal)
        };
        let second = execute(&store, "k1", user_id(), IdempotentAction::OrderPlacement, op)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_key_conflicts() {
        let store = MemoryIdempotencyStore::new();
        store
            .claim(
                "k2",
                user_id(),
                IdempotentAction::CartItemAdd,
                Utc::now(),
                KEY_TTL_SECONDS,
            )
            .await
            .unwrap();

        let err = execute(&store, "k2", user_id(), IdempotentAction::CartItemAdd, || async {
            panic!("operation must not run for an in-flight key");
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn failed_operation_releases_the_claim() {
        let store = MemoryIdempotencyStore::new();

        let err = execute(&store, "k3", user_id(), IdempotentAction::CartItemAdd, || async {
            Err(ApiError::Validation("cart is empty".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // The key is retryable and the retry executes.
        let response = execute(&store, "k3", user_id(), IdempotentAction::CartItemAdd, || async {
            StoredResponse::json(StatusCode::OK, &serde_json::json!({"ok": true}))
                .map_err(ApiError::Internal)
        })
        .await
        .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn expired_key_executes_again() {
        let store = MemoryIdempotencyStore::new();
        let stale = StoredResponse {
            status: 201,
            body: r#"{"old":true}"#.to_string(),
        };
        store.insert_completed("k4", user_id(), stale, Utc::now() - chrono::Duration::minutes(1));

        let response = execute(&store, "k4", user_id(), IdempotentAction::OrderPlacement, || async {
            StoredResponse::json(StatusCode::CREATED, &serde_json::json!({"new": true}))
                .map_err(ApiError::Internal)
        })
        .await
        .unwrap();
        assert_eq!(response.body, r#"{"new":true}"#);
    }

    #[test]
    fn stored_response_replays_status_and_body() {
        let stored = StoredResponse {
            status: 201,
            body: r#"{"status":"success"}"#.to_string(),
        };
        let response = stored.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
