//! Real-time connection hub.
//!
//! A [`Hub`] owns every live connection and serializes registration and
//! fan-out through one control loop. Each WebSocket gets a read pump that
//! feeds the [`MessageRouter`] and a write pump that drains the connection's
//! bounded outbound queue.

pub mod config;
pub mod connection;
pub mod handler;
pub mod hub;
pub mod router;
pub mod types;

pub use config::{HubConfig, PresenceBackend};
pub use connection::{Connection, EnqueueError, OutboundQueue};
pub use handler::ws_handler;
pub use hub::{Hub, HubError, HubHandle};
pub use router::MessageRouter;
pub use types::{
    ConnectionId, DecodeError, Envelope, Frame, InboundMessage, PresenceStatus, Route,
    ServerEvent,
};
