//! Dispatch of inbound client frames.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::{debug, info, warn};

use super::connection::Connection;
use super::hub::{HubError, HubHandle};
use super::types::{
    Envelope, InboundMessage, PrivateMessagePayload, ReadReceiptPayload, ServerEvent,
    TypingPayload,
};
use crate::messages::MessageStore;

/// Routes decoded frames from one read pump to the hub and the message store.
#[derive(Clone)]
pub struct MessageRouter {
    hub: HubHandle,
    messages: Arc<dyn MessageStore>,
    store_timeout: Duration,
}

impl MessageRouter {
    pub fn new(hub: HubHandle, messages: Arc<dyn MessageStore>, store_timeout: Duration) -> Self {
        Self {
            hub,
            messages,
            store_timeout,
        }
    }

    /// Decode and handle one text frame from `conn`.
    ///
    /// Malformed and unknown frames are logged and dropped. A stopped hub or a
    /// full delivery backlog is returned and ends the connection.
    pub async fn dispatch(&self, conn: &Connection, text: &str) -> Result<(), HubError> {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Dropping frame from user {} (connection {}): {}",
                    conn.user_id(),
                    conn.id(),
                    e
                );
                return Ok(());
            }
        };

        debug!(
            "Inbound {} from user {} (connection {})",
            message.kind(),
            conn.user_id(),
            conn.id()
        );

        match message {
            InboundMessage::PrivateMessage(payload) => self.private_message(conn, payload).await,
            InboundMessage::TypingIndicator(payload) => self.typing(conn, payload),
            InboundMessage::MessageRead(payload) => self.message_read(conn, payload).await,
            InboundMessage::DiscussionUpdate(delta) => self
                .hub
                .broadcast_except(conn.user_id(), ServerEvent::DiscussionUpdate(delta)),
            InboundMessage::Ping => {
                self.pong(conn);
                Ok(())
            }
        }
    }

    async fn private_message(
        &self,
        conn: &Connection,
        payload: PrivateMessagePayload,
    ) -> Result<(), HubError> {
        let sender_id = conn.user_id().to_string();
        let sent_at = Utc::now();

        let message_id = self
            .bounded("store_message", &sender_id, async {
                self.messages
                    .store_message(&sender_id, &payload.receiver_id, &payload.content, sent_at)
                    .await
            })
            .await;

        let receiver_online = self.hub.is_online(&payload.receiver_id).await;
        info!(
            "Private message from {} to {} (receiver online: {})",
            sender_id, payload.receiver_id, receiver_online
        );

        self.hub.send_to_user(
            &payload.receiver_id,
            ServerEvent::NewMessage {
                message_id: message_id.clone(),
                sender_id: sender_id.clone(),
                receiver_id: payload.receiver_id.clone(),
                content: payload.content,
                sent_at,
            },
        )?;

        self.hub.send_to_user(
            &sender_id,
            ServerEvent::MessageSent {
                message_id,
                receiver_id: payload.receiver_id,
                receiver_online,
            },
        )
    }

    fn typing(&self, conn: &Connection, payload: TypingPayload) -> Result<(), HubError> {
        self.hub.send_to_user(
            &payload.receiver_id,
            ServerEvent::TypingIndicator {
                sender_id: conn.user_id().to_string(),
                is_typing: payload.is_typing,
            },
        )
    }

    async fn message_read(
        &self,
        conn: &Connection,
        payload: ReadReceiptPayload,
    ) -> Result<(), HubError> {
        let reader_id = conn.user_id().to_string();

        if let Some(updated) = self
            .bounded("mark_read", &reader_id, async {
                self.messages.mark_read(&reader_id, &payload.sender_id).await
            })
            .await
        {
            debug!(
                "Marked {} message(s) from {} as read by {}",
                updated, payload.sender_id, reader_id
            );
        }

        self.hub
            .send_to_user(&payload.sender_id, ServerEvent::MessageRead { reader_id })
    }

    /// Enqueue a pong on the caller's own queue without going through the hub.
    fn pong(&self, conn: &Connection) {
        let frame = match Envelope::to_user(conn.user_id(), ServerEvent::Pong).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize pong: {}", e);
                return;
            }
        };
        if let Err(e) = conn.try_enqueue(frame) {
            warn!(
                "Cannot enqueue pong for connection {} (user {}): {}, disconnecting",
                conn.id(),
                conn.user_id(),
                e
            );
            conn.release(&self.hub);
        }
    }

    /// Run a store call under the configured timeout. Failures are logged and
    /// become `None`; real-time delivery goes ahead regardless.
    async fn bounded<T, F>(&self, op: &str, user_id: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!("Message store {} failed for user {}: {:#}", op, user_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "Message store {} timed out after {:?} for user {}",
                    op, self.store_timeout, user_id
                );
                None
            }
        }
    }
}
