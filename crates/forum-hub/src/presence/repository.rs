//! SQLite-backed presence store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use super::{PresenceRecord, PresenceStore};

/// Presence rows in the `presence_sessions` table.
#[derive(Debug, Clone)]
pub struct SqlitePresenceStore {
    pool: SqlitePool,
}

impl SqlitePresenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PresenceStore for SqlitePresenceStore {
    async fn upsert_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO presence_sessions (session_id, user_id, last_seen)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("upserting presence session")?;

        Ok(())
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM presence_sessions WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("deleting presence session")?;

        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<PresenceRecord>> {
        let rows = sqlx::query_as::<_, PresenceRecord>(
            r#"
            SELECT user_id, session_id, last_seen
            FROM presence_sessions
            ORDER BY last_seen ASC, session_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing presence sessions")?;

        Ok(rows)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM presence_sessions")
            .execute(&self.pool)
            .await
            .context("clearing presence sessions")?;

        Ok(result.rows_affected())
    }
}
