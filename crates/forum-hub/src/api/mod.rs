//! HTTP API module.
//!
//! Exposes the WebSocket endpoint, the presence queries and the event
//! publishing endpoint used by the forum's CRUD layer.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{ForumEventKind, HealthResponse, PublishEventRequest};
pub use routes::create_router;
pub use state::AppState;
