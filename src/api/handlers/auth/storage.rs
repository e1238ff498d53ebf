//! Store seams for credentials and refresh sessions.
//!
//! The traits exist so the guard and the auth handlers can be exercised
//! against in-memory doubles; production wiring always goes through the
//! Postgres implementations below. No session state is cached in-process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::types::Role;
use super::utils::is_unique_violation;

/// Durable record of an issued refresh token, bound to one device.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    /// SHA-256 of the refresh JWT; the raw token is never stored.
    pub token_hash: Vec<u8>,
    pub user_id: Uuid,
    pub user_agent: String,
    pub ip_address: String,
    pub expires_at: DateTime<Utc>,
}

/// A session row joined with the identity needed to mint a new access token.
#[derive(Clone, Debug)]
pub struct SessionOwner {
    pub session: SessionRecord,
    pub role: Role,
    pub email: String,
    pub first_name: String,
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub password_hash: String,
}

/// Outcome when attempting to create a new user.
#[derive(Debug)]
pub enum CreateUserOutcome {
    Created(UserRecord),
    EmailTaken,
}

/// Durable credential store; consulted only by sign-in/sign-up/password flows.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>>;
    async fn create(&self, user: NewUser) -> Result<CreateUserOutcome>;
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()>;
}

/// Durable store of refresh sessions, one row per active device.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: SessionRecord) -> Result<()>;
    /// Returns the row even when expired; the guard decides what stale means.
    async fn find_by_token_hash(&self, token_hash: &[u8]) -> Result<Option<SessionOwner>>;
    /// Idempotent; returns whether a row was deleted.
    async fn delete_by_token_hash(&self, token_hash: &[u8]) -> Result<bool>;
    /// Revoke every session for a user, e.g. after a password change.
    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64>;
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> UserRecord {
    let role: String = row.get("role");
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        phone_number: row.get("phone_number"),
        password_hash: row.get("password_hash"),
        role: Role::from_db(&role),
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, email, first_name, last_name, phone_number, password_hash, role::text AS role
            FROM users
            WHERE email = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by email")?;

        Ok(row.map(|row| user_from_row(&row)))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, email, first_name, last_name, phone_number, password_hash, role::text AS role
            FROM users
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;

        Ok(row.map(|row| user_from_row(&row)))
    }

    async fn create(&self, user: NewUser) -> Result<CreateUserOutcome> {
        let query = r"
            INSERT INTO users (email, first_name, last_name, phone_number, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, email, first_name, last_name, phone_number, password_hash, role::text AS role
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&user.email)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.phone_number)
            .bind(&user.password_hash)
            .fetch_one(&self.pool)
            .instrument(span)
            .await;

        match row {
            Ok(row) => Ok(CreateUserOutcome::Created(user_from_row(&row))),
            Err(err) if is_unique_violation(&err) => Ok(CreateUserOutcome::EmailTaken),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let query = r"
            UPDATE users
            SET password_hash = $2,
                updated_at = NOW()
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update password")?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: SessionRecord) -> Result<()> {
        // token_hash is the primary key, so two sessions can never share a
        // refresh token.
        let query = r"
            INSERT INTO refresh_sessions (token_hash, user_id, user_agent, ip_address, expires_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&session.token_hash)
            .bind(session.user_id)
            .bind(&session.user_agent)
            .bind(&session.ip_address)
            .bind(session.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert refresh session")?;
        Ok(())
    }

    async fn find_by_token_hash(&self, token_hash: &[u8]) -> Result<Option<SessionOwner>> {
        let query = r"
            SELECT s.token_hash, s.user_id, s.user_agent, s.ip_address, s.expires_at,
                   u.role::text AS role, u.email, u.first_name
            FROM refresh_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup refresh session")?;

        Ok(row.map(|row| {
            let role: String = row.get("role");
            SessionOwner {
                session: SessionRecord {
                    token_hash: row.get("token_hash"),
                    user_id: row.get("user_id"),
                    user_agent: row.get("user_agent"),
                    ip_address: row.get("ip_address"),
                    expires_at: row.get("expires_at"),
                },
                role: Role::from_db(&role),
                email: row.get("email"),
                first_name: row.get("first_name"),
            }
        }))
    }

    async fn delete_by_token_hash(&self, token_hash: &[u8]) -> Result<bool> {
        let query = "DELETE FROM refresh_sessions WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete refresh session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM refresh_sessions WHERE user_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete sessions for user")?;
        Ok(result.rows_affected())
    }
}
