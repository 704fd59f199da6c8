//! Authentication module for the dashboard's bearer-token session.
//!
//! This module provides:
//! - `decode_token_payload` / `expiry_instant`: read the `exp` claim of a
//!   bearer token without verifying it
//! - `SessionGuard`: gate access on token expiry and log out automatically
//!   when the stored token expires
//! - `UserProfile`: the stored user record that accompanies the token
//!
//! The token and profile live in a `Storage` backend and are always
//! cleared together.

pub mod error;
pub mod profile;
pub mod session;
pub mod token;

pub use error::AccessError;
pub use profile::UserProfile;
pub use session::{Session, SessionGuard, SessionState, EXPIRY_MARGIN};
pub use token::{decode_token_payload, expiry_instant, TokenPayload};
