//! Authentication for WebSocket upgrades and REST presence endpoints.
//!
//! Login and session issuance belong to the forum's CRUD layer. This module
//! only resolves an existing session token (cookie or bearer) to a user.

mod config;
mod error;
mod extractor;
mod lookup;

pub use config::{AuthConfig, DEV_ORIGINS};
pub use error::AuthError;
pub use extractor::{AuthState, CurrentUser};
pub use lookup::{SessionLookup, SqliteSessionLookup, UserIdentity};
