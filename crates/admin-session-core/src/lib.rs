//! Core library for the admin dashboard's client-side session handling.
//!
//! This crate provides:
//! - `auth`: bearer token decoding and the `SessionGuard` that gates access
//!   on token expiry and proactively logs out when the token expires
//! - `storage`: persistent key-value backends holding the stored credential
//! - `clock`: the time source used for expiry decisions
//! - `api`: an authenticated REST client that refuses to send stale tokens

pub mod api;
pub mod auth;
pub mod clock;
pub mod storage;

pub use api::{ApiClient, ApiError};
pub use auth::{
    decode_token_payload, expiry_instant, AccessError, Session, SessionGuard, SessionState,
    TokenPayload, UserProfile,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use storage::{Storage, StorageError, StorageKind};
