//! In-memory doubles for the store traits.
//!
//! These let the guard, the idempotency coordinator, and the handlers be
//! exercised without Postgres. The doubles mirror the semantics the SQL
//! implementations promise (atomic claim, write-once completion, returning
//! expired session rows) and count operations so tests can assert on the
//! number of reads and writes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::api::handlers::auth::guard::DeviceSignature;
use crate::api::handlers::auth::storage::{
    CreateUserOutcome, CredentialStore, NewUser, SessionOwner, SessionRecord, SessionStore,
    UserRecord,
};
use crate::api::handlers::auth::types::Role;
use crate::api::idempotency::{ClaimOutcome, IdempotencyStore, IdempotentAction, StoredResponse};

#[derive(Default)]
pub struct MemorySessionStore {
    rows: Mutex<HashMap<Vec<u8>, SessionOwner>>,
    finds: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    delete_attempts: AtomicU64,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_owner(
        &self,
        token_hash: Vec<u8>,
        user_id: Uuid,
        role: Role,
        email: &str,
        first_name: &str,
        device: DeviceSignature,
        expires_at: DateTime<Utc>,
    ) {
        let owner = SessionOwner {
            session: SessionRecord {
                token_hash: token_hash.clone(),
                user_id,
                user_agent: device.user_agent,
                ip_address: device.ip_address,
                expires_at,
            },
            role,
            email: email.to_string(),
            first_name: first_name.to_string(),
        };
        self.rows.lock().unwrap().insert(token_hash, owner);
    }

    pub fn finds(&self) -> u64 {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Deletes that actually removed a row.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Delete calls including those that matched nothing.
    pub fn delete_attempts(&self) -> u64 {
        self.delete_attempts.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: SessionRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        let owner = SessionOwner {
            session: session.clone(),
            role: Role::Customer,
            email: String::new(),
            first_name: String::new(),
        };
        rows.insert(session.token_hash, owner);
        Ok(())
    }

    async fn find_by_token_hash(&self, token_hash: &[u8]) -> Result<Option<SessionOwner>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.lock().unwrap().get(token_hash).cloned())
    }

    async fn delete_by_token_hash(&self, token_hash: &[u8]) -> Result<bool> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let removed = self.rows.lock().unwrap().remove(token_hash).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, owner| owner.session.user_id != user_id);
        let removed = (before - rows.len()) as u64;
        self.deletes.fetch_add(removed, Ordering::SeqCst);
        Ok(removed)
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    users: Mutex<HashMap<Uuid, UserRecord>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users.lock().unwrap().insert(user.id, user);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> Result<CreateUserOutcome> {
        let mut users = self.users.lock().unwrap();
        if users.values().any(|existing| existing.email == user.email) {
            return Ok(CreateUserOutcome::EmailTaken);
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            phone_number: user.phone_number,
            password_hash: user.password_hash,
            role: Role::Customer,
        };
        users.insert(record.id, record.clone());
        Ok(CreateUserOutcome::Created(record))
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        if let Some(user) = self.users.lock().unwrap().get_mut(&id) {
            user.password_hash = password_hash.to_string();
        }
        Ok(())
    }
}

#[allow(dead_code)]
struct KeyEntry {
    user_id: Uuid,
    action: &'static str,
    response: Option<StoredResponse>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryIdempotencyStore {
    keys: Mutex<HashMap<String, KeyEntry>>,
}

impl MemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key that already holds a stored response.
    pub fn insert_completed(
        &self,
        key: &str,
        user_id: Uuid,
        response: StoredResponse,
        expires_at: DateTime<Utc>,
    ) {
        self.keys.lock().unwrap().insert(
            key.to_string(),
            KeyEntry {
                user_id,
                action: "seeded",
                response: Some(response),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn claim(
        &self,
        key: &str,
        user_id: Uuid,
        action: IdempotentAction,
        now: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Result<ClaimOutcome> {
        let mut keys = self.keys.lock().unwrap();
        match keys.get(key) {
            Some(entry) if entry.expires_at > now => match &entry.response {
                Some(response) => Ok(ClaimOutcome::Completed(response.clone())),
                None => Ok(ClaimOutcome::InFlight),
            },
            _ => {
                // Absent or expired: this caller wins the claim.
                keys.insert(
                    key.to_string(),
                    KeyEntry {
                        user_id,
                        action: action.as_str(),
                        response: None,
                        expires_at: now + Duration::seconds(ttl_seconds),
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn complete(&self, key: &str, response: &StoredResponse) -> Result<()> {
        if let Some(entry) = self.keys.lock().unwrap().get_mut(key) {
            if entry.response.is_none() {
                entry.response = Some(response.clone());
            }
        }
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut keys = self.keys.lock().unwrap();
        if keys.get(key).is_some_and(|entry| entry.response.is_none()) {
            keys.remove(key);
        }
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut keys = self.keys.lock().unwrap();
        let before = keys.len();
        keys.retain(|_, entry| entry.expires_at > now);
        Ok((before - keys.len()) as u64)
    }
}
