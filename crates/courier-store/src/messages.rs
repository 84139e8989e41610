//! Message persistence and receipt-flag transitions.
//!
//! Flag updates are guarded in SQL (`... AND seen = 0`) so they are
//! monotonic at the storage level: a racing writer holding a stale copy
//! can never move `seen` back to `delivered` or `delivered` back to
//! `sent`.  Batch transitions use `UPDATE ... RETURNING` over the
//! receipt indexes instead of scanning the message list.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use courier_shared::types::{ConversationId, MessageBody, MessageId, UserId};

use crate::conversations;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{SendRecord, StoredMessage};
use crate::summaries;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender, receiver, body_text, file_ref, \
                               link_ref, client_token, sent, delivered, seen, created_at";

impl Database {
    /// Append a message to a conversation with `sent = true` and a
    /// server-assigned id and timestamp.  Bumps the conversation's
    /// `updated_at`.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: &UserId,
        receiver: &UserId,
        body: &MessageBody,
        client_token: Option<&str>,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let message = append_on(self.conn(), conversation_id, sender, receiver, body, client_token, now)?;
        touch_conversation_on(self.conn(), conversation_id, now)?;
        Ok(message)
    }

    /// Fetch a single message, scoped to its conversation.
    pub fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE id = ?1 AND conversation_id = ?2"
                ),
                params![message_id.0.to_string(), conversation_id.0.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Set the delivered flag on one message.  Returns `true` only when
    /// the flag actually changed.
    pub fn set_delivered(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        set_delivered_on(self.conn(), conversation_id, message_id)
    }

    /// Set the seen flag on one message (also sets delivered).  Returns
    /// `true` only when the flag actually changed.
    pub fn set_seen(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET seen = 1, delivered = 1
             WHERE id = ?1 AND conversation_id = ?2 AND seen = 0",
            params![message_id.0.to_string(), conversation_id.0.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Mark every unseen message from `from` to `to` as seen (and
    /// delivered).  Returns the affected message ids.
    pub fn mark_all_seen(
        &self,
        conversation_id: ConversationId,
        from: &UserId,
        to: &UserId,
    ) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare(
            "UPDATE messages SET seen = 1, delivered = 1
             WHERE conversation_id = ?1 AND sender = ?2 AND receiver = ?3 AND seen = 0
             RETURNING id",
        )?;

        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), from.as_str(), to.as_str()],
            |row| {
                let id_str: String = row.get(0)?;
                let id = Uuid::parse_str(&id_str).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok(MessageId(id))
            },
        )?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Mark every undelivered message addressed to `to` as delivered.
    /// Returns the affected message ids paired with each message's
    /// original sender, for per-sender notification fan-out.
    pub fn mark_all_delivered(
        &self,
        conversation_id: ConversationId,
        to: &UserId,
    ) -> Result<Vec<(MessageId, UserId)>> {
        let mut stmt = self.conn().prepare(
            "UPDATE messages SET delivered = 1
             WHERE conversation_id = ?1 AND receiver = ?2 AND delivered = 0
             RETURNING id, sender",
        )?;

        let rows = stmt.query_map(
            params![conversation_id.0.to_string(), to.as_str()],
            |row| {
                let id_str: String = row.get(0)?;
                let sender: String = row.get(1)?;
                let id = Uuid::parse_str(&id_str).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                Ok((MessageId(id), UserId::new(sender)))
            },
        )?;

        let mut affected = Vec::new();
        for row in rows {
            affected.push(row?);
        }
        Ok(affected)
    }

    /// All messages of a conversation in storage commit order.
    pub fn messages_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id.0.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The Delivery Engine's composite write, executed in a single
    /// transaction: find-or-create the conversation, unhide it for the
    /// sender, append the message (immediately delivered when the
    /// receiver is reachable), bump the conversation timestamp and
    /// upsert both participants' chat-list summaries.
    ///
    /// A failure anywhere rolls the whole send back; both parties'
    /// reported status always derives from the same committed state.
    ///
    /// When `client_token` matches an earlier message in the same
    /// conversation the send is a retry: the existing row is returned
    /// unchanged with `fresh = false`.
    pub fn record_outgoing(
        &mut self,
        sender: &UserId,
        receiver: &UserId,
        body: &MessageBody,
        client_token: Option<&str>,
        mark_delivered: bool,
    ) -> Result<SendRecord> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let mut conversation = conversations::find_or_create_on(&tx, sender, receiver)?;

        if let Some(token) = client_token {
            if let Some(existing) = find_by_client_token_on(&tx, conversation.id, token)? {
                tx.commit()?;
                tracing::debug!(
                    message = %existing.id,
                    token,
                    "send de-duplicated against earlier retry"
                );
                return Ok(SendRecord {
                    conversation,
                    message: existing,
                    fresh: false,
                });
            }
        }

        // A new message revives a conversation the sender had hidden.
        conversations::unhide_on(&tx, conversation.id, sender)?;

        let message = append_on(&tx, conversation.id, sender, receiver, body, client_token, now)?;

        let message = if mark_delivered {
            set_delivered_on(&tx, conversation.id, message.id)?;
            StoredMessage {
                delivered: true,
                ..message
            }
        } else {
            message
        };

        touch_conversation_on(&tx, conversation.id, now)?;
        conversation.updated_at = now;

        let preview = body.preview();
        summaries::upsert_on(&tx, sender, receiver, &preview, now)?;
        summaries::upsert_on(&tx, receiver, sender, &preview, now)?;

        tx.commit()?;

        Ok(SendRecord {
            conversation,
            message,
            fresh: true,
        })
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared with the transactional send path)
// ---------------------------------------------------------------------------

fn append_on(
    conn: &Connection,
    conversation_id: ConversationId,
    sender: &UserId,
    receiver: &UserId,
    body: &MessageBody,
    client_token: Option<&str>,
    now: DateTime<Utc>,
) -> Result<StoredMessage> {
    let id = MessageId::new();

    conn.execute(
        "INSERT INTO messages
             (id, conversation_id, sender, receiver, body_text, file_ref, link_ref,
              client_token, sent, delivered, seen, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 0, 0, ?9)",
        params![
            id.0.to_string(),
            conversation_id.0.to_string(),
            sender.as_str(),
            receiver.as_str(),
            body.text,
            body.file_ref,
            body.link_ref,
            client_token,
            now.to_rfc3339(),
        ],
    )?;

    Ok(StoredMessage {
        id,
        conversation_id,
        sender: sender.clone(),
        receiver: receiver.clone(),
        body: body.clone(),
        client_token: client_token.map(str::to_string),
        sent: true,
        delivered: false,
        seen: false,
        created_at: now,
    })
}

fn set_delivered_on(
    conn: &Connection,
    conversation_id: ConversationId,
    message_id: MessageId,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE messages SET delivered = 1
         WHERE id = ?1 AND conversation_id = ?2 AND delivered = 0",
        params![message_id.0.to_string(), conversation_id.0.to_string()],
    )?;
    Ok(affected > 0)
}

fn touch_conversation_on(
    conn: &Connection,
    conversation_id: ConversationId,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), conversation_id.0.to_string()],
    )?;
    Ok(())
}

fn find_by_client_token_on(
    conn: &Connection,
    conversation_id: ConversationId,
    token: &str,
) -> Result<Option<StoredMessage>> {
    let result = conn.query_row(
        &format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND client_token = ?2"
        ),
        params![conversation_id.0.to_string(), token],
        row_to_message,
    );

    match result {
        Ok(message) => Ok(Some(message)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(other) => Err(StoreError::Sqlite(other)),
    }
}

/// Map a `rusqlite::Row` to a [`StoredMessage`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_str: String = row.get(0)?;
    let conversation_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let receiver: String = row.get(3)?;
    let body_text: Option<String> = row.get(4)?;
    let file_ref: Option<String> = row.get(5)?;
    let link_ref: Option<String> = row.get(6)?;
    let client_token: Option<String> = row.get(7)?;
    let sent: bool = row.get(8)?;
    let delivered: bool = row.get(9)?;
    let seen: bool = row.get(10)?;
    let ts_str: String = row.get(11)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let conversation_id = Uuid::parse_str(&conversation_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(StoredMessage {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender: UserId::new(sender),
        receiver: UserId::new(receiver),
        body: MessageBody {
            text: body_text,
            file_ref,
            link_ref,
        },
        client_token,
        sent,
        delivered,
        seen,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db(dir: &tempfile::TempDir) -> Database {
        Database::open_at(&dir.path().join("test.db")).unwrap()
    }

    fn users() -> (UserId, UserId) {
        (UserId::new("alice"), UserId::new("bob"))
    }

    #[test]
    fn append_starts_sent_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        let message = db
            .append_message(conversation.id, &alice, &bob, &MessageBody::text("hi"), None)
            .unwrap();

        assert!(message.sent);
        assert!(!message.delivered);
        assert!(!message.seen);

        let stored = db.get_message(conversation.id, message.id).unwrap();
        assert_eq!(stored, message);
    }

    #[test]
    fn seen_implies_delivered_and_flags_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        let message = db
            .append_message(conversation.id, &alice, &bob, &MessageBody::text("hi"), None)
            .unwrap();

        assert!(db.set_seen(conversation.id, message.id).unwrap());
        let stored = db.get_message(conversation.id, message.id).unwrap();
        assert!(stored.delivered && stored.seen);

        // Re-applying either flag changes nothing.
        assert!(!db.set_seen(conversation.id, message.id).unwrap());
        assert!(!db.set_delivered(conversation.id, message.id).unwrap());

        let stored = db.get_message(conversation.id, message.id).unwrap();
        assert!(stored.sent && stored.delivered && stored.seen);
    }

    #[test]
    fn get_message_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        let missing = db.get_message(conversation.id, MessageId::new());
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[test]
    fn mark_all_seen_returns_affected_ids_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        let first = db
            .append_message(conversation.id, &alice, &bob, &MessageBody::text("one"), None)
            .unwrap();
        let second = db
            .append_message(conversation.id, &alice, &bob, &MessageBody::text("two"), None)
            .unwrap();
        // A message in the other direction must not be touched.
        let reply = db
            .append_message(conversation.id, &bob, &alice, &MessageBody::text("re"), None)
            .unwrap();

        let affected = db.mark_all_seen(conversation.id, &alice, &bob).unwrap();
        assert_eq!(affected.len(), 2);
        assert!(affected.contains(&first.id));
        assert!(affected.contains(&second.id));

        let reply_stored = db.get_message(conversation.id, reply.id).unwrap();
        assert!(!reply_stored.seen);

        // Second pass: nothing left to mark.
        let affected = db.mark_all_seen(conversation.id, &alice, &bob).unwrap();
        assert!(affected.is_empty());
    }

    #[test]
    fn mark_all_delivered_reports_senders() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        let message = db
            .append_message(conversation.id, &alice, &bob, &MessageBody::text("hi"), None)
            .unwrap();

        let affected = db.mark_all_delivered(conversation.id, &bob).unwrap();
        assert_eq!(affected, vec![(message.id, alice.clone())]);

        let stored = db.get_message(conversation.id, message.id).unwrap();
        assert!(stored.delivered && !stored.seen);

        assert!(db.mark_all_delivered(conversation.id, &bob).unwrap().is_empty());
    }

    #[test]
    fn record_outgoing_commits_everything_together() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_test_db(&dir);
        let (alice, bob) = users();

        let record = db
            .record_outgoing(&alice, &bob, &MessageBody::text("hi"), None, true)
            .unwrap();
        assert!(record.fresh);
        assert!(record.message.delivered);

        let stored = db
            .get_message(record.conversation.id, record.message.id)
            .unwrap();
        assert!(stored.delivered);

        // Both chat lists were updated by the same commit.
        assert_eq!(db.chat_list(&alice).unwrap().len(), 1);
        assert_eq!(db.chat_list(&bob).unwrap().len(), 1);
    }

    #[test]
    fn record_outgoing_unhides_only_the_sender() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        db.hide_for_participant(conversation.id, &alice).unwrap();
        db.hide_for_participant(conversation.id, &bob).unwrap();

        db.record_outgoing(&alice, &bob, &MessageBody::text("back"), None, false)
            .unwrap();

        assert!(!db.is_hidden_for(conversation.id, &alice).unwrap());
        assert!(db.is_hidden_for(conversation.id, &bob).unwrap());
    }

    #[test]
    fn record_outgoing_deduplicates_on_client_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open_test_db(&dir);
        let (alice, bob) = users();

        let first = db
            .record_outgoing(&alice, &bob, &MessageBody::text("hi"), Some("tok-1"), false)
            .unwrap();
        let retry = db
            .record_outgoing(&alice, &bob, &MessageBody::text("hi"), Some("tok-1"), true)
            .unwrap();

        assert!(first.fresh);
        assert!(!retry.fresh);
        assert_eq!(first.message.id, retry.message.id);
        // The retry must not mutate the committed row.
        assert!(!retry.message.delivered);

        let messages = db.messages_for_conversation(first.conversation.id).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn messages_come_back_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);
        let (alice, bob) = users();

        let conversation = db.find_or_create_conversation(&alice, &bob).unwrap();
        let mut expected = Vec::new();
        for i in 0..5 {
            let msg = db
                .append_message(
                    conversation.id,
                    &alice,
                    &bob,
                    &MessageBody::text(format!("m{i}")),
                    None,
                )
                .unwrap();
            expected.push(msg.id);
        }

        let stored: Vec<_> = db
            .messages_for_conversation(conversation.id)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(stored, expected);
    }
}
