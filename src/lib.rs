//! # MyShop (E-commerce Backend)
//!
//! `myshop` is an e-commerce backend whose hardened core is session handling
//! and request deduplication:
//!
//! ## Sessions (access + refresh tokens)
//!
//! Authentication issues two `JWT` kinds. Access tokens are short-lived and
//! self-contained; they are verified by signature and expiry alone and are
//! never persisted. Refresh tokens are long-lived and persisted (hashed) in
//! `refresh_sessions`, bound to the device signature observed at sign-in, so
//! they can be revoked before natural expiry.
//!
//! - **Rotation:** An expired access token is transparently re-minted from a
//!   valid refresh session; the refresh session row itself is left untouched.
//! - **Compromise detection:** A refresh presented from a different device
//!   signature (`x-device-id`/`user-agent` + client IP) deletes the session
//!   and signs the client out everywhere on that device. This is a
//!   best-effort binding, not a cryptographic guarantee.
//!
//! ## Idempotent mutations
//!
//! Cart mutation and order placement accept an `idempotency-key` header.
//! The first execution of a key snapshots the exact HTTP response; retries
//! within one hour replay that snapshot byte for byte without re-running the
//! side effects. The key claim is a single conditional upsert, so two
//! concurrent first attempts cannot both execute the operation.
//!
//! ## Outbound email
//!
//! Handlers never send email inline; they submit jobs to a DB-backed outbox
//! which a background worker drains with per-job priority and retry policy.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
