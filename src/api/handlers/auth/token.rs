//! Stateless signing and verification of the two token kinds.
//!
//! Access tokens carry enough identity to serve a request without touching
//! the database; refresh tokens carry only the user id, because their real
//! authority lives in the persisted session row. Verification never errors:
//! a bad signature and an expired token are both `None`, and the guard
//! decides what "invalid" means in context.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::AuthConfig;
use super::types::Role;

/// Claims embedded in a short-lived access token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub id: Uuid,
    pub role: Role,
    pub email: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims embedded in a long-lived refresh token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshClaims {
    pub id: Uuid,
    pub iat: i64,
    pub exp: i64,
}

pub struct TokenService {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl TokenService {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let access_secret = config.access_token_secret().expose_secret().as_bytes();
        let refresh_secret = config.refresh_token_secret().expose_secret().as_bytes();
        Self {
            access_encoding: EncodingKey::from_secret(access_secret),
            access_decoding: DecodingKey::from_secret(access_secret),
            refresh_encoding: EncodingKey::from_secret(refresh_secret),
            refresh_decoding: DecodingKey::from_secret(refresh_secret),
            access_ttl_seconds: config.access_ttl_seconds(),
            refresh_ttl_seconds: config.refresh_ttl_seconds(),
        }
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    /// Sign an access token for the given identity.
    pub fn issue_access(
        &self,
        user_id: Uuid,
        role: Role,
        email: &str,
        first_name: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = AccessClaims {
            id: user_id,
            role,
            email: email.to_string(),
            first_name: first_name.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + self.access_ttl_seconds,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.access_encoding)
            .context("failed to sign access token")
    }

    /// Sign a refresh token. The caller is responsible for persisting the
    /// matching session row; the token alone grants nothing.
    pub fn issue_refresh(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<String> {
        let claims = RefreshClaims {
            id: user_id,
            iat: now.timestamp(),
            exp: now.timestamp() + self.refresh_ttl_seconds,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.refresh_encoding,
        )
        .context("failed to sign refresh token")
    }

    /// Verify an access token. Signature failure and expiry are
    /// indistinguishable to the caller.
    #[must_use]
    pub fn verify_access(&self, token: &str) -> Option<AccessClaims> {
        decode::<AccessClaims>(token, &self.access_decoding, &validation())
            .map(|data| data.claims)
            .ok()
    }

    /// Verify a refresh token; same contract as [`Self::verify_access`].
    #[must_use]
    pub fn verify_refresh(&self, token: &str) -> Option<RefreshClaims> {
        decode::<RefreshClaims>(token, &self.refresh_decoding, &validation())
            .map(|data| data.claims)
            .ok()
    }
}

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation
}
