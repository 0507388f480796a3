//! A single live connection and its outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::hub::HubHandle;
use super::types::{ConnectionId, Frame};

/// Why a frame could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

#[derive(Debug)]
struct Shared {
    closed: CancellationToken,
    unregister_requested: AtomicBool,
    /// Unix milliseconds of the last inbound frame or pong.
    last_activity: AtomicI64,
    connected_at: DateTime<Utc>,
}

/// Handle to one live connection.
///
/// Cloned into the hub registry and into the connection's own read pump. The
/// receiving half of the queue is the [`OutboundQueue`] owned by the write pump.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    outbound: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection for `user_id` with a bounded outbound queue.
    pub fn new(user_id: impl Into<String>, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        let now = Utc::now();
        let shared = Arc::new(Shared {
            closed: CancellationToken::new(),
            unregister_requested: AtomicBool::new(false),
            last_activity: AtomicI64::new(now.timestamp_millis()),
            connected_at: now,
        });

        let conn = Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            outbound: tx,
            shared: shared.clone(),
        };
        let queue = OutboundQueue {
            rx,
            closed: shared.closed.clone(),
        };
        (conn, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.shared.connected_at
    }

    /// Enqueue a frame without waiting.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Close the outbound queue. The write pump drains what is already queued,
    /// sends a close frame and exits.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.shared
            .last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let millis = self.shared.last_activity.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis).unwrap_or(self.shared.connected_at)
    }

    /// Ask the hub to unregister this connection. Only the first call from any
    /// clone sends a request, so both pumps can call it on their way out.
    pub fn release(&self, hub: &HubHandle) {
        if self.shared.unregister_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if hub.unregister_connection(self.id).is_err() {
            // Hub already gone; nobody else will close the queue.
            debug!("hub stopped before connection {} was released", self.id);
            self.close();
        }
    }
}

/// Receiving half of a connection's outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
}

impl OutboundQueue {
    /// Next frame in FIFO order. After the connection is closed, frames that
    /// were already queued are still returned; `None` once drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        if self.closed.is_cancelled() {
            return self.rx.try_recv().ok();
        }
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    /// Next frame if one is queued right now.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Frame::from(text.to_string())
    }

    #[tokio::test]
    async fn frames_come_out_in_order() {
        let (conn, mut queue) = Connection::new("alice", 8);
        for i in 0..5 {
            conn.try_enqueue(frame(&i.to_string())).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.recv().await.unwrap().as_str(), i.to_string());
        }
    }

    #[test]
    fn full_queue_is_reported() {
        let (conn, _queue) = Connection::new("alice", 2);
        conn.try_enqueue(frame("a")).unwrap();
        conn.try_enqueue(frame("b")).unwrap();
        assert_eq!(conn.try_enqueue(frame("c")), Err(EnqueueError::Full));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let (conn, mut queue) = Connection::new("alice", 4);
        conn.try_enqueue(frame("a")).unwrap();
        conn.try_enqueue(frame("b")).unwrap();
        conn.close();

        assert_eq!(conn.try_enqueue(frame("c")), Err(EnqueueError::Closed));
        assert_eq!(queue.recv().await.unwrap().as_str(), "a");
        assert_eq!(queue.recv().await.unwrap().as_str(), "b");
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_receiver() {
        let (conn, mut queue) = Connection::new("alice", 4);
        let waiter = tokio::spawn(async move { queue.recv().await });
        tokio::task::yield_now().await;
        conn.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[test]
    fn touch_moves_last_activity_forward() {
        let (conn, _queue) = Connection::new("alice", 1);
        let before = conn.last_activity();
        std::thread::sleep(std::time::Duration::from_millis(5));
        conn.touch();
        assert!(conn.last_activity() > before);
    }

    #[test]
    fn clones_share_identity_and_state() {
        let (conn, _queue) = Connection::new("alice", 1);
        let other = conn.clone();
        assert_eq!(conn.id(), other.id());
        other.close();
        assert!(conn.is_closed());
    }
}
