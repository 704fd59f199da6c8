//! REST client for the admin dashboard API.
//!
//! Every request is gated through `SessionGuard::get_valid_token`: an
//! expired or missing token fails with `ApiError::Unauthorized` before any
//! network I/O, and a 401 from the server clears the stored credential.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
