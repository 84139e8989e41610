//! Delivery engine: accepts a new message, persists it, and derives the
//! receipt status to report to each side.
//!
//! Presence is consulted once, before the write; the reported status is
//! then derived from the committed row, never from a second read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use courier_shared::types::{ConversationId, DeliveryStatus, MessageBody, UserId};
use courier_store::{Database, StoredMessage};

use crate::error::ServerError;
use crate::presence::PresenceRegistry;

/// The store handle shared by every engine and request handler.
pub type SharedDb = Arc<Mutex<Database>>;

/// Result of a successful send, ready for fan-out by the gateway.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub conversation_id: ConversationId,
    pub message: StoredMessage,
    /// Status echoed to the sender: `Delivered` when the receiver was
    /// reachable at send time, else `Sent`.
    pub sender_status: DeliveryStatus,
    /// Status attached to the receiver's copy.  Always `Delivered`: the
    /// copy arrives the instant it is pushed.
    pub receiver_status: DeliveryStatus,
    /// Conversation activity timestamp of the committing write.
    pub timestamp: DateTime<Utc>,
    /// False when the send was de-duplicated against a client retry.
    pub fresh: bool,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    store: SharedDb,
    presence: PresenceRegistry,
}

impl DeliveryEngine {
    pub fn new(store: SharedDb, presence: PresenceRegistry) -> Self {
        Self { store, presence }
    }

    /// Accept, persist and classify a new message.
    ///
    /// Validation happens before any store write; a persistence failure
    /// aborts the whole send (the store path is one transaction).  The
    /// engine performs no retry; clients re-send with the same
    /// `client_token` and the store de-duplicates.
    pub async fn send_message(
        &self,
        sender: &UserId,
        receiver: &UserId,
        body: &MessageBody,
        client_token: Option<&str>,
    ) -> Result<SendOutcome, ServerError> {
        if sender.is_empty() || receiver.is_empty() {
            return Err(ServerError::InvalidSend(
                "sender and receiver are required".into(),
            ));
        }
        if sender == receiver {
            return Err(ServerError::InvalidSend(
                "cannot send a message to yourself".into(),
            ));
        }
        if body.is_empty() {
            return Err(ServerError::InvalidSend("message body is empty".into()));
        }

        // Advisory read; the committed row is what decides the status.
        let reachable = self.presence.is_reachable(receiver).await;

        let record = {
            let mut db = self.store.lock().await;
            db.record_outgoing(sender, receiver, body, client_token, reachable)?
        };

        let sender_status = if record.message.delivered {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };

        if record.fresh {
            info!(
                conversation = %record.conversation.id,
                message = %record.message.id,
                sender = %sender,
                receiver = %receiver,
                status = %sender_status,
                "message stored"
            );
        } else {
            debug!(
                conversation = %record.conversation.id,
                message = %record.message.id,
                "retry de-duplicated"
            );
        }

        Ok(SendOutcome {
            conversation_id: record.conversation.id,
            sender_status,
            receiver_status: DeliveryStatus::Delivered,
            timestamp: record.conversation.updated_at,
            fresh: record.fresh,
            message: record.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::types::ConnectionId;

    fn open_shared_db(dir: &tempfile::TempDir) -> SharedDb {
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        Arc::new(Mutex::new(db))
    }

    fn new_engine(store: SharedDb, presence: PresenceRegistry) -> DeliveryEngine {
        DeliveryEngine::new(store, presence)
    }

    #[tokio::test]
    async fn offline_receiver_yields_sent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let engine = new_engine(store.clone(), PresenceRegistry::new());

        let outcome = engine
            .send_message(
                &UserId::new("alice"),
                &UserId::new("bob"),
                &MessageBody::text("hi"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.sender_status, DeliveryStatus::Sent);
        assert_eq!(outcome.receiver_status, DeliveryStatus::Delivered);
        assert!(outcome.message.sent);
        assert!(!outcome.message.delivered);
        assert!(!outcome.message.seen);

        // A later announce does not retroactively change the stored flag.
        let db = store.lock().await;
        let stored = db
            .get_message(outcome.conversation_id, outcome.message.id)
            .unwrap();
        assert!(!stored.delivered);
    }

    #[tokio::test]
    async fn reachable_receiver_yields_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let presence = PresenceRegistry::new();
        presence
            .announce(ConnectionId::new(), UserId::new("bob"))
            .await;
        let engine = new_engine(store.clone(), presence);

        let outcome = engine
            .send_message(
                &UserId::new("alice"),
                &UserId::new("bob"),
                &MessageBody::text("hi"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.sender_status, DeliveryStatus::Delivered);

        let db = store.lock().await;
        let stored = db
            .get_message(outcome.conversation_id, outcome.message.id)
            .unwrap();
        assert!(stored.delivered && !stored.seen);
    }

    #[tokio::test]
    async fn validation_rejects_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let engine = new_engine(store.clone(), PresenceRegistry::new());

        let empty_body = engine
            .send_message(
                &UserId::new("alice"),
                &UserId::new("bob"),
                &MessageBody::default(),
                None,
            )
            .await;
        assert!(matches!(empty_body, Err(ServerError::InvalidSend(_))));

        let blank_sender = engine
            .send_message(
                &UserId::new("  "),
                &UserId::new("bob"),
                &MessageBody::text("hi"),
                None,
            )
            .await;
        assert!(matches!(blank_sender, Err(ServerError::InvalidSend(_))));

        let self_send = engine
            .send_message(
                &UserId::new("alice"),
                &UserId::new("alice"),
                &MessageBody::text("hi"),
                None,
            )
            .await;
        assert!(matches!(self_send, Err(ServerError::InvalidSend(_))));

        let db = store.lock().await;
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn send_revives_conversation_hidden_by_sender() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let engine = new_engine(store.clone(), PresenceRegistry::new());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let conversation_id = {
            let db = store.lock().await;
            let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
            db.hide_for_participant(conversation.id, &alice).unwrap();
            db.hide_for_participant(conversation.id, &bob).unwrap();
            conversation.id
        };

        engine
            .send_message(&alice, &bob, &MessageBody::text("back again"), None)
            .await
            .unwrap();

        let db = store.lock().await;
        assert!(!db.is_hidden_for(conversation_id, &alice).unwrap());
        assert!(db.is_hidden_for(conversation_id, &bob).unwrap());
    }

    #[tokio::test]
    async fn both_chat_lists_are_updated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let engine = new_engine(store.clone(), PresenceRegistry::new());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let file_only = MessageBody {
            file_ref: Some("https://files.example/photo".into()),
            ..MessageBody::default()
        };
        engine
            .send_message(&alice, &bob, &file_only, None)
            .await
            .unwrap();

        let db = store.lock().await;
        let alice_list = db.chat_list(&alice).unwrap();
        let bob_list = db.chat_list(&bob).unwrap();
        assert_eq!(alice_list.len(), 1);
        assert_eq!(bob_list.len(), 1);
        // Text-less message still produces a preview.
        assert_eq!(alice_list[0].preview, "[file]");
        assert_eq!(bob_list[0].preview, "[file]");
    }

    #[tokio::test]
    async fn concurrent_sends_both_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let engine = new_engine(store.clone(), PresenceRegistry::new());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let task_a = {
            let engine = engine.clone();
            let (alice, bob) = (alice.clone(), bob.clone());
            tokio::spawn(async move {
                engine
                    .send_message(&alice, &bob, &MessageBody::text("first"), None)
                    .await
            })
        };
        let task_b = {
            let engine = engine.clone();
            let (alice, bob) = (alice.clone(), bob.clone());
            tokio::spawn(async move {
                engine
                    .send_message(&alice, &bob, &MessageBody::text("second"), None)
                    .await
            })
        };

        let first = task_a.await.unwrap().unwrap();
        let second = task_b.await.unwrap().unwrap();

        // Both land in the one conversation, each with its own id.
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_ne!(first.message.id, second.message.id);

        let db = store.lock().await;
        let messages = db.messages_for_conversation(first.conversation_id).unwrap();
        assert_eq!(messages.len(), 2);
        let ids: Vec<_> = messages.iter().map(|m| m.id).collect();
        assert!(ids.contains(&first.message.id));
        assert!(ids.contains(&second.message.id));
    }

    #[tokio::test]
    async fn retry_with_same_token_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_shared_db(&dir);
        let engine = new_engine(store.clone(), PresenceRegistry::new());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let first = engine
            .send_message(&alice, &bob, &MessageBody::text("hi"), Some("tok-9"))
            .await
            .unwrap();
        let retry = engine
            .send_message(&alice, &bob, &MessageBody::text("hi"), Some("tok-9"))
            .await
            .unwrap();

        assert!(first.fresh);
        assert!(!retry.fresh);
        assert_eq!(first.message.id, retry.message.id);

        let db = store.lock().await;
        let messages = db.messages_for_conversation(first.conversation_id).unwrap();
        assert_eq!(messages.len(), 1);
    }
}
