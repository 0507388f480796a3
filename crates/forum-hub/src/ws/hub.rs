//! The hub: single owner of the connection registry and of every fan-out
//! decision.
//!
//! All mutations are submitted as commands on one FIFO channel and applied by
//! one task. Registration and unregistration of the same connection can
//! therefore never be reordered, and the first-session/last-session checks
//! that drive `user_status` events see a consistent registry. Read-only
//! queries take a read lock on the same registry; the loop holds the write
//! lock only for the duration of each mutation.
//!
//! Register, unregister and control commands are never refused. Deliveries
//! each hold a permit from a fixed backlog until the loop has applied them,
//! so a lagging loop pushes back on publishers instead of growing without
//! bound.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, TryAcquireError, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::config::HubConfig;
use super::connection::{Connection, EnqueueError};
use super::types::{ConnectionId, Envelope, PresenceStatus, Route, ServerEvent};
use crate::presence::PresenceStore;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,
    #[error("hub delivery backlog is full")]
    Busy,
}

enum HubCommand {
    Register(Connection),
    Unregister(ConnectionId),
    Deliver(Envelope, OwnedSemaphorePermit),
    /// Acknowledged once every earlier command has been applied.
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Connection registry.
///
/// A connection is in `connections` iff its id is in exactly one `by_user`
/// list, and `by_user` never holds an empty list.
#[derive(Debug, Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    /// Per-user connection ids in connection order.
    by_user: HashMap<String, Vec<ConnectionId>>,
}

impl Registry {
    /// Returns `Some(true)` when this is the user's first live connection,
    /// `None` when the id is already registered.
    fn insert(&mut self, conn: Connection) -> Option<bool> {
        if self.connections.contains_key(&conn.id()) {
            return None;
        }
        let sessions = self.by_user.entry(conn.user_id().to_string()).or_default();
        sessions.push(conn.id());
        let first = sessions.len() == 1;
        self.connections.insert(conn.id(), conn);
        Some(first)
    }

    /// Returns the removed connection and whether it was the user's last one.
    fn remove(&mut self, id: ConnectionId) -> Option<(Connection, bool)> {
        let conn = self.connections.remove(&id)?;
        let mut last = false;
        if let Some(sessions) = self.by_user.get_mut(conn.user_id()) {
            sessions.retain(|s| *s != id);
            if sessions.is_empty() {
                self.by_user.remove(conn.user_id());
                last = true;
            }
        }
        Some((conn, last))
    }

    fn drain(&mut self) -> Vec<Connection> {
        self.by_user.clear();
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    fn targets(&self, route: &Route) -> Vec<Connection> {
        match route {
            Route::All => self.connections.values().cloned().collect(),
            Route::User(user_id) => self
                .by_user
                .get(user_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default(),
            Route::AllExcept(user_id) => self
                .connections
                .values()
                .filter(|conn| conn.user_id() != user_id)
                .cloned()
                .collect(),
        }
    }

    fn session_count(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, Vec::len)
    }

    fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.by_user.keys().cloned().collect();
        users.sort();
        users
    }
}

/// The hub control loop. Constructed and spawned with [`Hub::spawn`].
pub struct Hub {
    config: Arc<HubConfig>,
    presence: Arc<dyn PresenceStore>,
    registry: Arc<RwLock<Registry>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
}

impl Hub {
    /// Start the control loop on the current runtime.
    ///
    /// The loop ends after [`HubHandle::shutdown`] or once every handle has
    /// been dropped.
    pub fn spawn(
        config: Arc<HubConfig>,
        presence: Arc<dyn PresenceStore>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(Registry::default()));
        let deliveries = Arc::new(Semaphore::new(config.delivery_backlog));

        let hub = Hub {
            config,
            presence,
            registry: registry.clone(),
            commands: rx,
        };
        let task = tokio::spawn(hub.run());

        (
            HubHandle {
                commands: tx,
                registry,
                deliveries,
            },
            task,
        )
    }

    async fn run(mut self) {
        info!("Hub control loop started");

        while let Some(command) = self.commands.recv().await {
            if let HubCommand::Shutdown(done) = command {
                self.close_all().await;
                let _ = done.send(());
                info!("Hub control loop stopped");
                return;
            }

            // A panic inside one command must not take the loop down. Registry
            // mutations are single HashMap operations under the write lock, so
            // an unwind leaves the registry consistent. Presence writes catch
            // their own panics so that status events still follow.
            if AssertUnwindSafe(self.apply(command))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("Hub command panicked; continuing with the next command");
            }
        }

        self.close_all().await;
        info!("Hub control loop stopped: all handles dropped");
    }

    async fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(conn) => self.register(conn).await,
            HubCommand::Unregister(id) => {
                if let Some(offline) = self.detach(id).await {
                    self.deliver(offline).await;
                }
            }
            HubCommand::Deliver(envelope, _permit) => self.deliver(envelope).await,
            HubCommand::Flush(ack) => {
                let _ = ack.send(());
            }
            HubCommand::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    async fn register(&mut self, conn: Connection) {
        let id = conn.id();
        let user_id = conn.user_id().to_string();

        if conn.is_closed() {
            debug!("Connection {} closed before registration, skipping", id);
            return;
        }

        let first = {
            let mut registry = self.registry.write().await;
            registry.insert(conn)
        };
        let Some(first) = first else {
            warn!("Connection {} is already registered", id);
            return;
        };

        info!("Registered connection {} for user {}", id, user_id);

        // The presence row is written before anyone can observe the status
        // event.
        let presence = self.presence.clone();
        let session_id = id.to_string();
        self.bounded_presence_write(
            "upsert",
            &user_id,
            &session_id,
            presence.upsert_session(&user_id, &session_id),
        )
        .await;

        if first {
            info!("User {} is online", user_id);
            self.deliver(Envelope::to_all(ServerEvent::UserStatus {
                user_id,
                status: PresenceStatus::Online,
            }))
            .await;
        }
    }

    /// Remove a connection, close its queue and delete its presence row.
    /// Returns the `offline` envelope when it was the user's last connection.
    /// Unknown ids are a no-op.
    async fn detach(&mut self, id: ConnectionId) -> Option<Envelope> {
        let removed = {
            let mut registry = self.registry.write().await;
            registry.remove(id)
        };
        let Some((conn, last)) = removed else {
            debug!("Connection {} is not registered, ignoring unregister", id);
            return None;
        };

        conn.close();
        info!(
            "Unregistered connection {} for user {}",
            id,
            conn.user_id()
        );

        let presence = self.presence.clone();
        let session_id = id.to_string();
        self.bounded_presence_write(
            "delete",
            conn.user_id(),
            &session_id,
            presence.delete_session(conn.user_id(), &session_id),
        )
        .await;

        if !last {
            return None;
        }

        info!("User {} is offline", conn.user_id());
        Some(Envelope::to_all(ServerEvent::UserStatus {
            user_id: conn.user_id().to_string(),
            status: PresenceStatus::Offline,
        }))
    }

    /// Enqueue an envelope on every targeted connection. Connections that
    /// cannot accept it are shed; offline events caused by shedding are
    /// delivered in turn.
    async fn deliver(&mut self, envelope: Envelope) {
        let mut pending = VecDeque::from([envelope]);

        while let Some(envelope) = pending.pop_front() {
            let frame = match envelope.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to serialize {} event: {}", envelope.event.kind(), e);
                    continue;
                }
            };

            let targets = self.registry.read().await.targets(&envelope.route);
            let mut shed = Vec::new();
            for conn in targets {
                match conn.try_enqueue(frame.clone()) {
                    Ok(()) => {}
                    Err(EnqueueError::Full) => {
                        warn!(
                            "Outbound queue full for connection {} (user {}), disconnecting",
                            conn.id(),
                            conn.user_id()
                        );
                        shed.push(conn.id());
                    }
                    Err(EnqueueError::Closed) => {
                        debug!("Connection {} already closed, removing", conn.id());
                        shed.push(conn.id());
                    }
                }
            }

            for id in shed {
                if let Some(offline) = self.detach(id).await {
                    pending.push_back(offline);
                }
            }
        }
    }

    /// Run one presence write under the configured timeout. Errors, timeouts
    /// and panics are logged and otherwise ignored.
    async fn bounded_presence_write<F>(&self, op: &str, user_id: &str, session_id: &str, write: F)
    where
        F: Future<Output = Result<()>>,
    {
        let write = AssertUnwindSafe(write).catch_unwind();
        match tokio::time::timeout(self.config.presence_write_timeout(), write).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(
                "Presence {} failed for session {} (user {}): {:#}",
                op, session_id, user_id, e
            ),
            Ok(Err(_)) => error!(
                "Presence {} panicked for session {} (user {})",
                op, session_id, user_id
            ),
            Err(_) => warn!(
                "Presence {} timed out for session {} (user {})",
                op, session_id, user_id
            ),
        }
    }

    async fn close_all(&mut self) {
        let connections = {
            let mut registry = self.registry.write().await;
            registry.drain()
        };
        if connections.is_empty() {
            return;
        }

        info!("Closing {} connection(s)", connections.len());
        for conn in connections {
            conn.close();
            let presence = self.presence.clone();
            let session_id = conn.id().to_string();
            self.bounded_presence_write(
                "delete",
                conn.user_id(),
                &session_id,
                presence.delete_session(conn.user_id(), &session_id),
            )
            .await;
        }
    }
}

/// Cloneable handle used by the transport, the router and REST handlers.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    registry: Arc<RwLock<Registry>>,
    deliveries: Arc<Semaphore>,
}

impl HubHandle {
    fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Closed)
    }

    pub fn register_connection(&self, conn: Connection) -> Result<(), HubError> {
        self.submit(HubCommand::Register(conn))
    }

    /// Idempotent: unregistering an unknown connection does nothing.
    pub fn unregister_connection(&self, id: ConnectionId) -> Result<(), HubError> {
        self.submit(HubCommand::Unregister(id))
    }

    /// Queue an envelope for fan-out. Fails with [`HubError::Busy`] when the
    /// delivery backlog is exhausted.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), HubError> {
        let permit = self
            .deliveries
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => HubError::Busy,
                TryAcquireError::Closed => HubError::Closed,
            })?;
        self.submit(HubCommand::Deliver(envelope, permit))
    }

    /// Deliver to every connection of one user. A no-op if the user is offline.
    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> Result<(), HubError> {
        self.deliver(Envelope::to_user(user_id, event))
    }

    pub fn broadcast(&self, event: ServerEvent) -> Result<(), HubError> {
        self.deliver(Envelope::to_all(event))
    }

    pub fn broadcast_except(&self, user_id: &str, event: ServerEvent) -> Result<(), HubError> {
        self.deliver(Envelope::to_all_except(user_id, event))
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.registry.read().await.session_count(user_id) > 0
    }

    /// Users with at least one live connection, sorted.
    pub async fn list_online(&self) -> Vec<String> {
        self.registry.read().await.online_users()
    }

    pub async fn session_count(&self, user_id: &str) -> usize {
        self.registry.read().await.session_count(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Wait until every command submitted before this call has been applied.
    pub async fn flush(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::Flush(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Close every connection, remove their presence rows and stop the loop.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::Shutdown(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresenceStore;
    use crate::ws::connection::OutboundQueue;
    use crate::ws::types::Frame;
    use serde_json::{Value, json};

    fn spawn_hub() -> (HubHandle, Arc<MemoryPresenceStore>) {
        let presence = Arc::new(MemoryPresenceStore::new());
        let (hub, _task) = Hub::spawn(Arc::new(HubConfig::default()), presence.clone());
        (hub, presence)
    }

    fn connect(hub: &HubHandle, user: &str, capacity: usize) -> (Connection, OutboundQueue) {
        let (conn, queue) = Connection::new(user, capacity);
        hub.register_connection(conn.clone()).unwrap();
        (conn, queue)
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(frame) = queue.try_recv() {
            out.push(parse(&frame));
        }
        out
    }

    fn parse(frame: &Frame) -> Value {
        serde_json::from_str(frame.as_str()).unwrap()
    }

    fn statuses(frames: &[Value], user: &str) -> Vec<String> {
        frames
            .iter()
            .filter(|f| f["type"] == "user_status" && f["data"]["userId"] == user)
            .map(|f| f["data"]["status"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn one_online_and_one_offline_per_presence_window() {
        let (hub, _) = spawn_hub();
        let (_obs, mut observer) = connect(&hub, "observer", 64);

        let (s1, _q1) = connect(&hub, "alice", 64);
        hub.flush().await.unwrap();
        assert_eq!(statuses(&drain(&mut observer), "alice"), vec!["online"]);

        let (s2, _q2) = connect(&hub, "alice", 64);
        hub.flush().await.unwrap();
        assert!(statuses(&drain(&mut observer), "alice").is_empty());

        hub.unregister_connection(s1.id()).unwrap();
        hub.flush().await.unwrap();
        assert!(statuses(&drain(&mut observer), "alice").is_empty());
        assert!(hub.is_online("alice").await);

        hub.unregister_connection(s2.id()).unwrap();
        hub.flush().await.unwrap();
        assert_eq!(statuses(&drain(&mut observer), "alice"), vec!["offline"]);
        assert!(!hub.is_online("alice").await);
    }

    #[tokio::test]
    async fn interleaved_sessions_never_flap() {
        let (hub, _) = spawn_hub();
        let (_obs, mut observer) = connect(&hub, "observer", 1024);

        // Register five tabs and close them in a different order, with
        // extra duplicate unregisters mixed in.
        let conns: Vec<_> = (0..5).map(|_| connect(&hub, "alice", 64)).collect();
        for i in [3usize, 0, 4, 3, 1, 0, 2] {
            hub.unregister_connection(conns[i].0.id()).unwrap();
        }
        hub.flush().await.unwrap();

        assert_eq!(
            statuses(&drain(&mut observer), "alice"),
            vec!["online", "offline"]
        );
        assert_eq!(hub.list_online().await, vec!["observer".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_registrations_serialize_through_the_loop() {
        let (hub, _) = spawn_hub();
        let (_obs, mut observer) = connect(&hub, "observer", 1024);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                let (conn, queue) = Connection::new("alice", 64);
                hub.register_connection(conn.clone()).unwrap();
                tokio::task::yield_now().await;
                hub.unregister_connection(conn.id()).unwrap();
                drop(queue);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        hub.flush().await.unwrap();

        let seen = statuses(&drain(&mut observer), "alice");
        // Each window opens with online and closes with offline.
        assert!(!seen.is_empty());
        assert_eq!(seen.len() % 2, 0);
        for pair in seen.chunks(2) {
            assert_eq!(pair, ["online", "offline"]);
        }
        assert!(!hub.is_online("alice").await);
    }

    #[tokio::test]
    async fn double_unregister_emits_single_offline() {
        let (hub, _) = spawn_hub();
        let (_obs, mut observer) = connect(&hub, "observer", 64);
        let (conn, _queue) = connect(&hub, "bob", 64);

        hub.unregister_connection(conn.id()).unwrap();
        hub.unregister_connection(conn.id()).unwrap();
        hub.flush().await.unwrap();

        assert_eq!(statuses(&drain(&mut observer), "bob"), vec!["online", "offline"]);
    }

    #[tokio::test]
    async fn release_sends_only_one_unregister() {
        let (hub, _) = spawn_hub();
        let (conn, _queue) = connect(&hub, "bob", 64);
        conn.release(&hub);
        conn.clone().release(&hub);
        hub.flush().await.unwrap();
        assert!(!hub.is_online("bob").await);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn send_to_user_reaches_every_session_of_that_user_only() {
        let (hub, _) = spawn_hub();
        let (_a1, mut qa1) = connect(&hub, "alice", 64);
        let (_a2, mut qa2) = connect(&hub, "alice", 64);
        let (_b, mut qb) = connect(&hub, "bob", 64);
        hub.flush().await.unwrap();
        drain(&mut qa1);
        drain(&mut qa2);
        drain(&mut qb);

        hub.send_to_user("alice", ServerEvent::MessageRead { reader_id: "bob".into() })
            .unwrap();
        hub.flush().await.unwrap();

        assert_eq!(drain(&mut qa1).len(), 1);
        assert_eq!(drain(&mut qa2).len(), 1);
        assert!(drain(&mut qb).is_empty());
    }

    #[tokio::test]
    async fn send_to_offline_user_is_a_no_op() {
        let (hub, _) = spawn_hub();
        hub.send_to_user("ghost", ServerEvent::Pong).unwrap();
        hub.flush().await.unwrap();
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_except_skips_all_sessions_of_the_sender() {
        let (hub, _) = spawn_hub();
        let (_a1, mut qa1) = connect(&hub, "alice", 64);
        let (_a2, mut qa2) = connect(&hub, "alice", 64);
        let (_b1, mut qb1) = connect(&hub, "bob", 64);
        let (_b2, mut qb2) = connect(&hub, "bob", 64);
        let (_c, mut qc) = connect(&hub, "carol", 64);
        hub.flush().await.unwrap();
        for q in [&mut qa1, &mut qa2, &mut qb1, &mut qb2, &mut qc] {
            drain(q);
        }

        hub.broadcast_except("alice", ServerEvent::DiscussionUpdate(json!({"postId": 7})))
            .unwrap();
        hub.flush().await.unwrap();

        assert!(drain(&mut qa1).is_empty());
        assert!(drain(&mut qa2).is_empty());
        for q in [&mut qb1, &mut qb2, &mut qc] {
            let frames = drain(q);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "discussion_update");
            assert_eq!(frames[0]["data"]["postId"], 7);
        }
    }

    #[tokio::test]
    async fn per_connection_order_is_preserved() {
        let (hub, _) = spawn_hub();
        let (_conn, mut queue) = connect(&hub, "alice", 256);
        hub.flush().await.unwrap();
        drain(&mut queue);

        for i in 0..100 {
            hub.send_to_user("alice", ServerEvent::NewPost(json!({ "seq": i })))
                .unwrap();
        }
        hub.flush().await.unwrap();

        let seqs: Vec<i64> = drain(&mut queue)
            .iter()
            .map(|f| f["data"]["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn full_queue_sheds_only_that_connection() {
        let (hub, _) = spawn_hub();
        let (_obs, mut observer) = connect(&hub, "observer", 64);
        let (slow, _slow_queue) = connect(&hub, "alice", 2);
        let (_fast, mut fast_queue) = connect(&hub, "alice", 64);
        hub.flush().await.unwrap();
        drain(&mut observer);

        for i in 0..4 {
            hub.send_to_user("alice", ServerEvent::NewPost(json!({ "seq": i })))
                .unwrap();
        }
        hub.flush().await.unwrap();

        assert!(slow.is_closed());
        assert_eq!(hub.session_count("alice").await, 1);
        assert!(hub.is_online("alice").await);
        assert!(statuses(&drain(&mut observer), "alice").is_empty());
        assert!(drain(&mut fast_queue).len() >= 4);
    }

    #[tokio::test]
    async fn shedding_the_last_session_announces_offline() {
        let (hub, _) = spawn_hub();
        let (_obs, mut observer) = connect(&hub, "observer", 64);
        let (slow, _slow_queue) = connect(&hub, "alice", 1);
        hub.flush().await.unwrap();
        drain(&mut observer);

        // Alice's own online event already fills the queue.
        hub.send_to_user("alice", ServerEvent::Pong).unwrap();
        hub.flush().await.unwrap();

        assert!(slow.is_closed());
        assert!(!hub.is_online("alice").await);
        assert_eq!(statuses(&drain(&mut observer), "alice"), vec!["offline"]);
    }

    #[tokio::test]
    async fn presence_rows_follow_registrations() {
        let (hub, presence) = spawn_hub();
        let (a1, _q1) = connect(&hub, "alice", 64);
        let (_a2, _q2) = connect(&hub, "alice", 64);
        hub.flush().await.unwrap();
        assert_eq!(presence.list_sessions().await.unwrap().len(), 2);

        hub.unregister_connection(a1.id()).unwrap();
        hub.flush().await.unwrap();
        let rows = presence.list_sessions().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].session_id, a1.id().to_string());
    }

    #[tokio::test]
    async fn list_online_matches_live_connections() {
        let (hub, _) = spawn_hub();
        let (a, _qa) = connect(&hub, "alice", 64);
        let (_b, _qb) = connect(&hub, "bob", 64);
        hub.flush().await.unwrap();
        assert_eq!(hub.list_online().await, vec!["alice", "bob"]);

        hub.unregister_connection(a.id()).unwrap();
        hub.flush().await.unwrap();
        assert_eq!(hub.list_online().await, vec!["bob"]);
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_clears_presence() {
        let (hub, presence) = spawn_hub();
        let (a, _qa) = connect(&hub, "alice", 64);
        let (b, _qb) = connect(&hub, "bob", 64);

        hub.shutdown().await.unwrap();

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(presence.list_sessions().await.unwrap().is_empty());
        assert!(hub.broadcast(ServerEvent::Pong).is_err());
    }

    struct FailingPresence;

    #[async_trait::async_trait]
    impl PresenceStore for FailingPresence {
        async fn upsert_session(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("database is locked")
        }
        async fn delete_session(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("database is locked")
        }
        async fn list_sessions(&self) -> Result<Vec<crate::presence::PresenceRecord>> {
            Ok(Vec::new())
        }
        async fn clear(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn presence_failures_do_not_block_status_events() {
        let (hub, _task) = Hub::spawn(Arc::new(HubConfig::default()), Arc::new(FailingPresence));
        let (_obs, mut observer) = connect(&hub, "observer", 64);
        let (alice, _qa) = connect(&hub, "alice", 64);
        hub.unregister_connection(alice.id()).unwrap();
        hub.flush().await.unwrap();

        assert_eq!(statuses(&drain(&mut observer), "alice"), vec!["online", "offline"]);
    }

    struct PanickingPresence;

    #[async_trait::async_trait]
    impl PresenceStore for PanickingPresence {
        async fn upsert_session(&self, user_id: &str, _: &str) -> Result<()> {
            if user_id == "boom" {
                panic!("presence backend exploded");
            }
            Ok(())
        }
        async fn delete_session(&self, user_id: &str, _: &str) -> Result<()> {
            if user_id == "boom" {
                panic!("presence backend exploded");
            }
            Ok(())
        }
        async fn list_sessions(&self) -> Result<Vec<crate::presence::PresenceRecord>> {
            Ok(Vec::new())
        }
        async fn clear(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn panicking_presence_keeps_the_status_window_intact() {
        let (hub, _task) =
            Hub::spawn(Arc::new(HubConfig::default()), Arc::new(PanickingPresence));
        let (_obs, mut observer) = connect(&hub, "observer", 64);
        let (boom, _qb) = connect(&hub, "boom", 64);
        let (_alice, _qa) = connect(&hub, "alice", 64);
        hub.flush().await.unwrap();

        assert!(hub.is_running());
        assert!(hub.is_online("alice").await);
        assert!(hub.is_online("boom").await);
        assert_eq!(statuses(&drain(&mut observer), "boom"), vec!["online"]);

        hub.unregister_connection(boom.id()).unwrap();
        hub.flush().await.unwrap();

        assert!(!hub.is_online("boom").await);
        assert!(boom.is_closed());
        assert_eq!(statuses(&drain(&mut observer), "boom"), vec!["offline"]);
    }

    #[tokio::test]
    async fn full_delivery_backlog_refuses_until_the_loop_catches_up() {
        let config = HubConfig {
            delivery_backlog: 2,
            ..HubConfig::default()
        };
        let (hub, _task) = Hub::spawn(Arc::new(config), Arc::new(MemoryPresenceStore::new()));
        let (_conn, mut queue) = connect(&hub, "alice", 64);

        // The loop cannot run before the first await on this runtime.
        hub.broadcast(ServerEvent::NewPost(json!({ "seq": 0 }))).unwrap();
        hub.broadcast(ServerEvent::NewPost(json!({ "seq": 1 }))).unwrap();
        assert!(matches!(
            hub.broadcast(ServerEvent::NewPost(json!({ "seq": 2 }))),
            Err(HubError::Busy)
        ));
        // Registrations are not subject to the backlog.
        let (_bob, _qb) = connect(&hub, "bob", 64);

        hub.flush().await.unwrap();
        hub.broadcast(ServerEvent::NewPost(json!({ "seq": 3 }))).unwrap();
        hub.flush().await.unwrap();

        let seqs: Vec<i64> = drain(&mut queue)
            .iter()
            .filter(|f| f["type"] == "new_post")
            .map(|f| f["data"]["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 3]);
        assert!(hub.is_online("bob").await);
    }
}
