//! Authentication configuration.

use serde::{Deserialize, Serialize};

/// Localhost origins allowed in dev mode.
pub const DEV_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the cookie that carries the forum session token.
    pub cookie_name: String,
    /// Browser origins allowed to call the API and open WebSockets. Pages
    /// served from the hub's own host are always allowed to connect.
    pub allowed_origins: Vec<String>,
    /// Development mode additionally allows [`DEV_ORIGINS`].
    pub dev_mode: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cookie_name: "session_id".to_string(),
            allowed_origins: Vec::new(),
            dev_mode: false,
        }
    }
}

impl AuthConfig {
    /// Whether a cross-origin browser request from `origin` is allowed.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins
            .iter()
            .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
            || (self.dev_mode && DEV_ORIGINS.contains(&origin))
    }
}
