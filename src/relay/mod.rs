//! At-most-once message relay between conversation participants.
//!
//! Messages sit in `message_queue` only until the recipient's next pull,
//! which reads and deletes them in one transaction. Nothing is kept after
//! delivery.

use crate::error::{ServiceError, ServiceResult};
use crate::store::models::{map_message_row, MESSAGE_COLUMNS};
use crate::store::{find_conversation, ConversationState, QueuedMessage, Store};
use crate::util::{digest_id, format_timestamp, is_blank, parse_timestamp};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const CONVERSATION_REQUEST: &str = "conversation_request";

/// One outbound item of a heartbeat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Outbound {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub conversation_id: String,
    pub from_agent_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// An outbound item that could not be relayed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedSend {
    pub conversation_id: String,
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    pub inbound: Vec<QueuedMessage>,
    pub notifications: Vec<Notification>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedSend>,
}

/// Queue `content` for `to`. The id mixes content, time and a random nonce
/// so identical messages in the same microsecond stay distinct.
pub(crate) fn enqueue(
    conn: &Connection,
    conversation_id: &str,
    from: &str,
    to: &str,
    content: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<QueuedMessage> {
    let created_at = format_timestamp(now);
    let nonce = uuid::Uuid::new_v4().to_string();
    let id = digest_id(&[conversation_id, from, content, &created_at, &nonce]);
    conn.execute(
        "INSERT INTO message_queue (id, conversation_id, from_agent, to_agent, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, conversation_id, from, to, content, created_at],
    )?;
    Ok(QueuedMessage {
        id,
        conversation_id: conversation_id.to_string(),
        from_agent: from.to_string(),
        to_agent: to.to_string(),
        content: content.to_string(),
        created_at: now,
    })
}

pub struct MessageRelay {
    store: Arc<Store>,
}

impl MessageRelay {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Queue a message for the other participant.
    ///
    /// A reply from the target of a pending conversation accepts it: the
    /// state flips to `active` in the same transaction as the enqueue.
    pub fn send(
        &self,
        sender: &str,
        conversation_id: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<QueuedMessage> {
        if is_blank(conversation_id) {
            return Err(ServiceError::validation("conversation_id is required"));
        }
        if is_blank(content) {
            return Err(ServiceError::validation("message is required"));
        }
        let stamp = format_timestamp(now);

        self.store.with_transaction(|tx| {
            let conversation =
                find_conversation(tx, conversation_id)?.ok_or(ServiceError::ConversationNotFound)?;
            let recipient = conversation
                .counterpart(sender)
                .ok_or(ServiceError::NotParticipant)?
                .to_string();

            if conversation.state == ConversationState::PendingAcceptance
                && conversation.target_agent == sender
            {
                let flipped = tx.execute(
                    "UPDATE conversations SET state = 'active', updated_at = ?1
                     WHERE id = ?2 AND state = 'pending_acceptance'",
                    params![stamp, conversation.id],
                )?;
                if flipped > 0 {
                    tracing::info!(conversation_id = %conversation.id, "Conversation accepted");
                }
            } else if !conversation.state.is_terminal() {
                tx.execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    params![stamp, conversation.id],
                )?;
            }

            Ok(enqueue(tx, &conversation.id, sender, &recipient, content, now)?)
        })
    }

    /// Drain every message queued for `recipient`, oldest first.
    pub fn pull(&self, recipient: &str) -> ServiceResult<Vec<QueuedMessage>> {
        self.store.with_transaction(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM message_queue
                 WHERE to_agent = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let messages = stmt
                .query_map(params![recipient], map_message_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            if !messages.is_empty() {
                tx.execute(
                    "DELETE FROM message_queue WHERE to_agent = ?1",
                    params![recipient],
                )?;
            }
            Ok(messages)
        })
    }

    /// Pending requests addressed to `recipient`, newest first. Read-only.
    pub fn pending_notifications(&self, recipient: &str) -> ServiceResult<Vec<Notification>> {
        let rows = self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, initiator_agent, created_at FROM conversations
                 WHERE target_agent = ?1 AND state = 'pending_acceptance'
                 ORDER BY created_at DESC, id ASC",
            )?;
            let rows = stmt.query_map(params![recipient], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        rows.into_iter()
            .map(|(conversation_id, from_agent_id, created_at)| -> ServiceResult<Notification> {
                Ok(Notification {
                    kind: CONVERSATION_REQUEST,
                    conversation_id,
                    from_agent_id,
                    message: "New conversation request".into(),
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    /// One heartbeat: relay each outbound item, then pull, then list
    /// notifications. A failed outbound item is reported and skipped.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        outbound: &[Outbound],
        now: DateTime<Utc>,
    ) -> ServiceResult<HeartbeatResponse> {
        let mut failed = Vec::new();
        for item in outbound {
            if let Err(e) = self.send(agent_id, &item.conversation_id, &item.message, now) {
                tracing::warn!(
                    agent_id,
                    conversation_id = %item.conversation_id,
                    "Failed to relay outbound message: {e}"
                );
                failed.push(FailedSend {
                    conversation_id: item.conversation_id.clone(),
                    error: e.code(),
                    message: e.to_string(),
                });
            }
        }

        let inbound = self.pull(agent_id)?;
        let notifications = self.pending_notifications(agent_id)?;
        Ok(HeartbeatResponse {
            inbound,
            notifications,
            failed,
        })
    }
}
