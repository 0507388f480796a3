//! Presence data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A live session as recorded in the presence table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub session_id: String,
    /// RFC 3339 timestamp of the last write for this session.
    pub last_seen: String,
}
