//! Session token resolution.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// The authenticated user behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: String,
    pub nickname: String,
}

/// Resolves a session token to the user that owns it.
#[async_trait]
pub trait SessionLookup: Send + Sync {
    /// Returns `None` when the token is unknown or expired.
    async fn user_from_token(&self, token: &str) -> Result<Option<UserIdentity>>;
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    nickname: String,
    expires_at: String,
}

/// Parse an `auth_sessions.expires_at` value.
///
/// Accepts RFC 3339 with any offset and SQLite's `YYYY-MM-DD HH:MM:SS[.fff]`
/// (as written by `CURRENT_TIMESTAMP`), which is taken as UTC.
fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Looks tokens up in the forum's `auth_sessions` table.
#[derive(Debug, Clone)]
pub struct SqliteSessionLookup {
    pool: SqlitePool,
}

impl SqliteSessionLookup {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionLookup for SqliteSessionLookup {
    async fn user_from_token(&self, token: &str) -> Result<Option<UserIdentity>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT u.id, u.nickname, s.expires_at
            FROM auth_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("looking up session token")?;

        let Some(row) = row else {
            return Ok(None);
        };

        match parse_expiry(&row.expires_at) {
            Some(expires_at) if expires_at > Utc::now() => Ok(Some(UserIdentity {
                id: row.id,
                nickname: row.nickname,
            })),
            Some(_) => Ok(None),
            None => {
                warn!(
                    "Session for user {} has unreadable expires_at {:?}, rejecting",
                    row.id, row.expires_at
                );
                Ok(None)
            }
        }
    }
}
