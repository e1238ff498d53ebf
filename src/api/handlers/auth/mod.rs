//! Authentication: token issuance, the per-request guard, and session
//! storage.
//!
//! The flows split along the two token kinds. Sign-up and login mint both
//! tokens and persist a device-bound session row for the refresh token;
//! the guard in [`guard`] consumes the cookie pair on every protected
//! request and transparently rotates expired access tokens. Logout and
//! password changes revoke sessions through the same [`storage`] seam.

pub(crate) mod guard;
pub(crate) mod login;
pub(crate) mod session;
pub(crate) mod signup;
pub(crate) mod state;
pub(crate) mod storage;
pub(crate) mod token;
pub(crate) mod types;
pub(crate) mod users;
pub(crate) mod utils;

pub use state::{AuthConfig, AuthState};
