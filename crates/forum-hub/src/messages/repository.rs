//! SQLite-backed message store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::MessageStore;

/// Messages in the `private_messages` table.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of unread messages addressed to `receiver_id`.
    pub async fn unread_count(&self, receiver_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM private_messages WHERE receiver_id = ? AND read_at IS NULL",
        )
        .bind(receiver_id)
        .fetch_one(&self.pool)
        .await
        .context("counting unread messages")?;

        Ok(count)
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn store_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO private_messages (id, sender_id, receiver_id, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(sender_id)
        .bind(receiver_id)
        .bind(content)
        .bind(timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("storing private message")?;

        Ok(id)
    }

    async fn mark_read(&self, receiver_id: &str, sender_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE private_messages
            SET read_at = ?
            WHERE receiver_id = ? AND sender_id = ? AND read_at IS NULL
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(receiver_id)
        .bind(sender_id)
        .execute(&self.pool)
        .await
        .context("marking messages read")?;

        Ok(result.rows_affected())
    }
}
