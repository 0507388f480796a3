//! WebSocket transport: upgrade, read pump and write pump.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, header},
    response::Response,
};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;

use crate::api::{ApiResult, AppState};
use crate::auth::{AuthError, CurrentUser, UserIdentity};

use super::config::HubConfig;
use super::connection::{Connection, OutboundQueue};
use super::hub::HubHandle;
use super::router::MessageRouter;
use super::types::{Envelope, ServerEvent};

/// WebSocket upgrade handler.
///
/// GET /ws
///
/// Browsers always send `Origin` on upgrades and CORS does not apply to
/// them, so the origin is checked here. Requests without one come from
/// non-browser clients and are allowed.
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or_default();
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default();
        if !same_origin(origin, host) && !state.auth.origin_allowed(origin) {
            warn!(
                "Rejecting WebSocket upgrade for user {} from origin {:?}",
                user.id(),
                origin
            );
            return Err(AuthError::ForbiddenOrigin(origin.to_string()).into());
        }
    }

    info!("WebSocket upgrade request from user {}", user.id());
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user.0)))
}

/// `origin` names the host the request was sent to.
fn same_origin(origin: &str, host: &str) -> bool {
    let authority = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .map(|rest| rest.trim_end_matches('/'));
    matches!(authority, Some(authority) if !host.is_empty() && authority.eq_ignore_ascii_case(host))
}

/// Drive one connection from registration to unregistration.
async fn handle_ws_connection(socket: WebSocket, state: AppState, user: UserIdentity) {
    let config = state.hub_config.clone();
    let (conn, queue) = Connection::new(user.id.clone(), config.outbound_capacity);

    // Queued before registration so it is the first frame the client sees.
    let connected = Envelope::to_user(
        user.id.clone(),
        ServerEvent::Connected {
            connection_id: conn.id(),
            user_id: user.id.clone(),
        },
    );
    match connected.to_frame() {
        Ok(frame) => {
            if let Err(e) = conn.try_enqueue(frame) {
                error!("Failed to queue connected event for {}: {}", user.id, e);
                return;
            }
        }
        Err(e) => {
            error!("Failed to serialize connected event for {}: {}", user.id, e);
            return;
        }
    }

    if let Err(e) = state.hub.register_connection(conn.clone()) {
        warn!("Rejecting connection for user {}: {}", user.id, e);
        return;
    }

    let (sender, receiver) = socket.split();

    let mut writer = tokio::spawn(write_pump(
        sender,
        queue,
        conn.clone(),
        state.hub.clone(),
        config.clone(),
    ));

    read_pump(receiver, &conn, &state.router, config.read_timeout()).await;
    conn.release(&state.hub);

    // The hub closes the queue once it processes the unregister; the writer
    // then flushes, sends a close frame and exits.
    if tokio::time::timeout(config.write_timeout(), &mut writer)
        .await
        .is_err()
    {
        debug!("Write pump for connection {} did not stop in time", conn.id());
        writer.abort();
    }

    info!(
        "WebSocket connection {} closed for user {} after {}s",
        conn.id(),
        user.id,
        (Utc::now() - conn.connected_at()).num_seconds()
    );
}

async fn read_pump(
    mut receiver: SplitStream<WebSocket>,
    conn: &Connection,
    router: &MessageRouter,
    read_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = conn.closed() => {
                debug!("Connection {} closed by hub, stopping read pump", conn.id());
                return;
            }
            next = tokio::time::timeout(read_timeout, receiver.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                info!(
                    "No traffic from user {} for {:?} (last at {}), dropping connection {}",
                    conn.user_id(),
                    read_timeout,
                    conn.last_activity().to_rfc3339(),
                    conn.id()
                );
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error for user {}: {}", conn.user_id(), e);
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        conn.touch();

        match msg {
            Message::Text(text) => {
                if let Err(e) = router.dispatch(conn, text.as_str()).await {
                    warn!("Stopping connection {}: {}", conn.id(), e);
                    return;
                }
            }
            Message::Binary(_) => {
                debug!("Received binary message from user {}, ignoring", conn.user_id());
            }
            Message::Ping(_) => {
                // Answered by axum.
                debug!("Received ping from user {}", conn.user_id());
            }
            Message::Pong(_) => {}
            Message::Close(_) => {
                info!("User {} closed WebSocket connection", conn.user_id());
                return;
            }
        }
    }
}

async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut queue: OutboundQueue,
    conn: Connection,
    hub: HubHandle,
    config: Arc<HubConfig>,
) {
    let write_timeout = config.write_timeout();
    let mut ping_interval = tokio::time::interval(config.ping_interval());
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    let _ = tokio::time::timeout(write_timeout, sender.send(Message::Close(None))).await;
                    let _ = tokio::time::timeout(write_timeout, sender.close()).await;
                    break;
                };
                if !send(&mut sender, Message::Text(frame), write_timeout, &conn).await {
                    break;
                }
            }

            // Ping on every tick, even after outbound traffic. A client that
            // never sends renews its read deadline only through pongs.
            _ = ping_interval.tick() => {
                if !send(&mut sender, Message::Ping(Bytes::new()), write_timeout, &conn).await {
                    break;
                }
            }
        }
    }

    conn.release(&hub);
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    write_timeout: Duration,
    conn: &Connection,
) -> bool {
    match tokio::time::timeout(write_timeout, sender.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Write to connection {} failed: {}", conn.id(), e);
            false
        }
        Err(_) => {
            warn!(
                "Write to connection {} (user {}) timed out after {:?}",
                conn.id(),
                conn.user_id(),
                write_timeout
            );
            false
        }
    }
}
