//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use forum_hub::api;
use forum_hub::auth::{AuthConfig, AuthState, SqliteSessionLookup};
use forum_hub::db::Database;
use forum_hub::messages::SqliteMessageStore;
use forum_hub::presence::{PresenceStore, SqlitePresenceStore};
use forum_hub::ws::{Hub, HubConfig, HubHandle};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A fully wired application over an in-memory database.
pub struct TestApp {
    pub router: Router,
    pub hub: HubHandle,
    pub db: Database,
    pub presence: Arc<dyn PresenceStore>,
}

/// Create a test application with all services initialized.
pub async fn test_app() -> TestApp {
    test_app_with(HubConfig::default()).await
}

pub async fn test_app_with(hub_config: HubConfig) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let hub_config = Arc::new(hub_config);

    let presence: Arc<dyn PresenceStore> = Arc::new(SqlitePresenceStore::new(db.pool().clone()));
    let (hub, _task) = Hub::spawn(hub_config.clone(), presence.clone());

    let messages = Arc::new(SqliteMessageStore::new(db.pool().clone()));
    let sessions = Arc::new(SqliteSessionLookup::new(db.pool().clone()));
    let auth_state = AuthState::new(AuthConfig::default(), sessions);

    let state = api::AppState::new(
        hub.clone(),
        hub_config,
        presence.clone(),
        messages,
        auth_state,
    );

    TestApp {
        router: api::create_router(state),
        hub,
        db,
        presence,
    }
}

/// Insert a user with a live session and return its token.
pub async fn seed_user(db: &Database, user_id: &str) -> String {
    let token = format!("token-{user_id}");
    sqlx::query("INSERT INTO users (id, nickname) VALUES (?, ?)")
        .bind(user_id)
        .bind(format!("nick-{user_id}"))
        .execute(db.pool())
        .await
        .unwrap();
    sqlx::query("INSERT INTO auth_sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(&token)
        .bind(user_id)
        .bind((Utc::now() + chrono::Duration::hours(1)).to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();
    token
}

/// Serve the app on an ephemeral port.
pub async fn spawn_server(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket authenticated with the session cookie and consume the
/// `connected` greeting.
pub async fn connect(addr: SocketAddr, token: &str) -> Client {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert(
        header::COOKIE,
        format!("session_id={token}").parse().unwrap(),
    );
    let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let greeting = next_event(&mut client).await;
    assert_eq!(greeting["type"], "connected");
    client
}

/// Next JSON envelope, skipping protocol frames.
pub async fn next_event(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("connection closed: {frame:?}"),
            _ => continue,
        }
    }
}

/// Next envelope of the given type, skipping everything else.
pub async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let event = next_event(client).await;
        if event["type"] == kind {
            return event;
        }
    }
}

/// Collect every envelope that arrives within `window`.
pub async fn drain_events(client: &mut Client, window: Duration) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(Some(Ok(msg))) = tokio::time::timeout(window, client.next()).await {
        if let Message::Text(text) = msg {
            events.push(serde_json::from_str(text.as_str()).unwrap());
        }
    }
    events
}

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Wait until the hub has applied every command submitted so far.
pub async fn settle(app: &TestApp) {
    // Transport tasks submit commands asynchronously; give them a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;
    app.hub.flush().await.unwrap();
}
