//! Application state shared across handlers.

use std::sync::Arc;

use axum::extract::FromRef;

use crate::auth::AuthState;
use crate::messages::MessageStore;
use crate::presence::PresenceStore;
use crate::ws::{HubConfig, HubHandle, MessageRouter};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the running hub control loop.
    pub hub: HubHandle,
    /// Queue sizes and deadlines for new connections.
    pub hub_config: Arc<HubConfig>,
    /// Dispatcher for inbound WebSocket frames.
    pub router: MessageRouter,
    /// Durable presence rows (read-only from handlers).
    pub presence: Arc<dyn PresenceStore>,
    /// Authentication state.
    pub auth: AuthState,
}

impl AppState {
    /// Create new application state around a running hub.
    pub fn new(
        hub: HubHandle,
        hub_config: Arc<HubConfig>,
        presence: Arc<dyn PresenceStore>,
        messages: Arc<dyn MessageStore>,
        auth: AuthState,
    ) -> Self {
        let router = MessageRouter::new(hub.clone(), messages, hub_config.store_timeout());
        Self {
            hub,
            hub_config,
            router,
            presence,
            auth,
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
