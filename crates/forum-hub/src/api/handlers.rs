//! REST handlers for health, presence queries and forum event publishing.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::auth::CurrentUser;
use crate::presence::PresenceRecord;
use crate::ws::{Envelope, ServerEvent};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<String>,
}

/// Users with at least one live connection.
///
/// GET /api/online
pub async fn list_online(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> Json<OnlineUsersResponse> {
    Json(OnlineUsersResponse {
        users: state.hub.list_online().await,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOnlineResponse {
    pub user_id: String,
    pub online: bool,
    pub sessions: usize,
}

/// GET /api/online/{user_id}
pub async fn user_online(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(user_id): Path<String>,
) -> Json<UserOnlineResponse> {
    let sessions = state.hub.session_count(&user_id).await;
    Json(UserOnlineResponse {
        user_id,
        online: sessions > 0,
        sessions,
    })
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub sessions: Vec<PresenceRecord>,
}

/// Durable presence rows.
///
/// GET /api/presence
pub async fn list_presence(
    State(state): State<AppState>,
    _user: CurrentUser,
) -> ApiResult<Json<PresenceResponse>> {
    let sessions = state.presence.list_sessions().await?;
    Ok(Json(PresenceResponse { sessions }))
}

/// Forum events the CRUD layer may publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForumEventKind {
    NewPost,
    NewComment,
    DiscussionUpdate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventRequest {
    #[serde(rename = "type")]
    pub kind: ForumEventKind,
    #[serde(default)]
    pub data: Value,
    /// Deliver only to this user's sessions.
    pub target_user: Option<String>,
    /// Deliver to everyone except this user's sessions.
    pub exclude_user: Option<String>,
}

/// Publish a forum event to connected clients.
///
/// POST /api/events
#[instrument(skip(state, request), fields(user_id = %user.id()))]
pub async fn publish_event(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<PublishEventRequest>,
) -> ApiResult<StatusCode> {
    let event = match request.kind {
        ForumEventKind::NewPost => ServerEvent::NewPost(request.data),
        ForumEventKind::NewComment => ServerEvent::NewComment(request.data),
        ForumEventKind::DiscussionUpdate => ServerEvent::DiscussionUpdate(request.data),
    };

    let envelope = match (request.target_user, request.exclude_user) {
        (Some(_), Some(_)) => {
            return Err(ApiError::bad_request(
                "targetUser and excludeUser are mutually exclusive",
            ));
        }
        (Some(target), None) => Envelope::to_user(target, event),
        (None, Some(excluded)) => Envelope::to_all_except(excluded, event),
        (None, None) => Envelope::to_all(event),
    };

    info!(kind = envelope.event.kind(), "Publishing forum event");
    state.hub.deliver(envelope)?;

    Ok(StatusCode::ACCEPTED)
}
