//! Status propagator: applies delivered/seen transitions to stored
//! messages and produces the notifications owed to the original senders.
//!
//! Every operation is monotonic (backed by guarded store updates) and
//! silent when nothing changed: zero affected rows means zero
//! notifications.

use chrono::{DateTime, Utc};
use tracing::debug;

use courier_shared::types::{ConversationId, DeliveryStatus, MessageId, UserId};
use courier_store::StoreError;

use crate::delivery::SharedDb;
use crate::error::ServerError;

/// Which receipt flag to raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Delivered,
    Seen,
}

/// A single receipt transition, addressed to the message's original
/// sender.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    /// The user to notify: whoever sent the message originally.
    pub sender: UserId,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

/// A batch of messages marked seen in one call, addressed to the one
/// sender they share.
#[derive(Debug, Clone)]
pub struct SeenBatch {
    pub conversation_id: ConversationId,
    /// The user to notify (sender of every affected message).
    pub sender: UserId,
    pub message_ids: Vec<MessageId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StatusPropagator {
    store: SharedDb,
}

impl StatusPropagator {
    pub fn new(store: SharedDb) -> Self {
        Self { store }
    }

    /// Raise one flag on one message.
    ///
    /// A missing message is benign (stale or removed id) and yields
    /// `None`, as does a flag that was already set.
    pub async fn mark_one(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        kind: StatusKind,
    ) -> Result<Option<StatusUpdate>, ServerError> {
        let db = self.store.lock().await;

        let message = match db.get_message(conversation_id, message_id) {
            Ok(message) => message,
            Err(StoreError::NotFound) => {
                debug!(
                    conversation = %conversation_id,
                    message = %message_id,
                    "ignoring status update for unknown message"
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let (changed, status) = match kind {
            StatusKind::Delivered => (
                db.set_delivered(conversation_id, message_id)?,
                DeliveryStatus::Delivered,
            ),
            StatusKind::Seen => (
                db.set_seen(conversation_id, message_id)?,
                DeliveryStatus::Read,
            ),
        };

        if !changed {
            return Ok(None);
        }

        Ok(Some(StatusUpdate {
            conversation_id,
            message_id,
            sender: message.sender,
            status,
            timestamp: Utc::now(),
        }))
    }

    /// Mark every unseen message from `from` to `to` as seen.
    ///
    /// Returns one batched notification for `from`, or `None` when no
    /// message changed.
    pub async fn mark_all_seen(
        &self,
        conversation_id: ConversationId,
        from: &UserId,
        to: &UserId,
    ) -> Result<Option<SeenBatch>, ServerError> {
        let message_ids = {
            let db = self.store.lock().await;
            db.mark_all_seen(conversation_id, from, to)?
        };

        if message_ids.is_empty() {
            return Ok(None);
        }

        debug!(
            conversation = %conversation_id,
            count = message_ids.len(),
            reader = %to,
            "messages marked seen"
        );

        Ok(Some(SeenBatch {
            conversation_id,
            sender: from.clone(),
            message_ids,
            timestamp: Utc::now(),
        }))
    }

    /// Mark every undelivered message addressed to `to` as delivered.
    ///
    /// Returns one update per affected message, each addressed to that
    /// message's own sender, so fan-out stays correct even if the store
    /// ever holds messages from more than one sender per target.
    pub async fn mark_all_delivered(
        &self,
        conversation_id: ConversationId,
        to: &UserId,
    ) -> Result<Vec<StatusUpdate>, ServerError> {
        let affected = {
            let db = self.store.lock().await;
            db.mark_all_delivered(conversation_id, to)?
        };

        if !affected.is_empty() {
            debug!(
                conversation = %conversation_id,
                count = affected.len(),
                receiver = %to,
                "messages marked delivered"
            );
        }

        let now = Utc::now();
        Ok(affected
            .into_iter()
            .map(|(message_id, sender)| StatusUpdate {
                conversation_id,
                message_id,
                sender,
                status: DeliveryStatus::Delivered,
                timestamp: now,
            })
            .collect())
    }
}
