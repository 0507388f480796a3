//! Private message persistence used by the real-time router.

mod repository;

pub use repository::SqliteMessageStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage backend for private messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return its id.
    async fn store_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String>;

    /// Mark every unread message from `sender_id` to `receiver_id` as read.
    /// Returns the number of messages updated.
    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64>;
}
