//! Postgres-backed idempotency store and the expired-key sweeper.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info_span, Instrument};
use uuid::Uuid;

use super::{ClaimOutcome, IdempotencyStore, IdempotentAction, StoredResponse};

#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn claim(
        &self,
        key: &str,
        user_id: Uuid,
        action: IdempotentAction,
        now: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome> {
        let expires_at = now + ChronoDuration::seconds(ttl_seconds);

        // One statement decides the winner: a fresh insert claims the key,
        // and the DO UPDATE arm re-claims a row only when it has expired.
        // A live row (in flight or completed) makes the upsert return
        // nothing, which is the losing side.
        let query = r"
            INSERT INTO idempotency_keys (key, user_id, action, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE
            SET user_id = EXCLUDED.user_id,
                action = EXCLUDED.action,
                expires_at = EXCLUDED.expires_at,
                response_status = NULL,
                response_body = NULL,
                created_at = NOW()
            WHERE idempotency_keys.expires_at <= $5
            RETURNING key
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let claimed = sqlx::query(query)
            .bind(key)
            .bind(user_id)
            .bind(action.as_str())
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to claim idempotency key")?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let query = r"
            SELECT response_status, response_body
            FROM idempotency_keys
            WHERE key = $1
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load idempotency key")?;

        // The row can vanish between the upsert and this read if the owner
        // released it; treat that as still in flight and let the client retry.
        let Some(row) = row else {
            return Ok(ClaimOutcome::InFlight);
        };

        let status: Option<i32> = row.get("response_status");
        let body: Option<String> = row.get("response_body");
        match (status, body) {
            (Some(status), Some(body)) => Ok(ClaimOutcome::Completed(StoredResponse {
                status: u16::try_from(status).unwrap_or(200),
                body,
            })),
            _ => Ok(ClaimOutcome::InFlight),
        }
    }

    async fn complete(&self, key: &str, response: &StoredResponse) -> Result<()> {
        // Write-once: never overwrite a stored response.
        let query = r"
            UPDATE idempotency_keys
            SET response_status = $2,
                response_body = $3
            WHERE key = $1
              AND response_status IS NULL
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(key)
            .bind(i32::from(response.status))
            .bind(&response.body)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store idempotency response")?;
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        // Only unresolved claims are released; a stored response stays.
        let query = r"
            DELETE FROM idempotency_keys
            WHERE key = $1
              AND response_status IS NULL
        ";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(key)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to release idempotency key")?;
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM idempotency_keys WHERE expires_at <= $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep expired idempotency keys")?;
        Ok(result.rows_affected())
    }
}

/// Spawn the background task that drops expired keys. Correctness does not
/// depend on it (expired rows are treated as absent); it only keeps the table
/// small.
pub fn spawn_key_sweeper(pool: PgPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let store = PgIdempotencyStore::new(pool);
        loop {
            sleep(interval).await;
            match store.sweep_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => debug!("Swept {removed} expired idempotency keys"),
                Err(err) => error!("Idempotency key sweep failed: {err:#}"),
            }
        }
    })
}
