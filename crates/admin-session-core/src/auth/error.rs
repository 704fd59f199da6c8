use thiserror::Error;

/// Why the admin page gate refused access. Callers redirect to login on
/// either variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Not authenticated - session missing or expired")]
    NotAuthenticated,

    #[error("Admin access required (role: {})", .role.as_deref().unwrap_or("none"))]
    NotAdmin { role: Option<String> },
}
