//! In-process presence store, used when no durable backend is configured.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{PresenceRecord, PresenceStore};

/// Presence rows held in memory. Contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    rows: Mutex<BTreeMap<String, PresenceRecord>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            last_seen: Utc::now().to_rfc3339(),
        };
        self.rows.lock().await.insert(session_id.to_string(), record);
        Ok(())
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.get(session_id).is_some_and(|r| r.user_id == user_id) {
            rows.remove(session_id);
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<PresenceRecord>> {
        let mut rows: Vec<PresenceRecord> = self.rows.lock().await.values().cloned().collect();
        rows.sort_by(|a, b| a.last_seen.cmp(&b.last_seen));
        Ok(rows)
    }

    async fn clear(&self) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let count = rows.len() as u64;
        rows.clear();
        Ok(count)
    }
}
