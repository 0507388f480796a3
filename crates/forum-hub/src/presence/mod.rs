//! Durable presence records.
//!
//! One row per live WebSocket connection. The hub writes rows from inside its
//! control loop; REST handlers only read them.

mod memory;
mod models;
mod repository;

pub use memory::MemoryPresenceStore;
pub use models::PresenceRecord;
pub use repository::SqlitePresenceStore;

use anyhow::Result;
use async_trait::async_trait;

/// Storage backend for presence rows.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or refresh the row for `session_id`.
    async fn upsert_session(&self, user_id: &str, session_id: &str) -> Result<()>;

    /// Remove the row for `session_id`. Missing rows are not an error.
    async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<()>;

    /// All rows, oldest first.
    async fn list_sessions(&self) -> Result<Vec<PresenceRecord>>;

    /// Remove every row. Returns the number of rows deleted.
    async fn clear(&self) -> Result<u64>;
}
