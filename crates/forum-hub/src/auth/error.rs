//! Authentication errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Neither a session cookie nor a bearer token was presented.
    #[error("missing session credentials")]
    MissingCredentials,

    /// The token does not match a live session.
    #[error("invalid or expired session")]
    InvalidSession,

    /// A browser page from an origin that is not allowed.
    #[error("origin not allowed: {0}")]
    ForbiddenOrigin(String),

    #[error("authentication backend error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        AuthError::Internal(format!("{err:#}"))
    }
}
