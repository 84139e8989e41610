//! Conversation lookup, creation and per-participant hide markers.
//!
//! The free functions operating on a `&Connection` are shared with the
//! transactional send path in [`crate::messages`].

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use courier_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Conversation;

impl Database {
    /// Look up the conversation for an unordered participant pair,
    /// creating an empty one if absent.
    ///
    /// Order-independent and idempotent: `(a, b)` and `(b, a)` resolve to
    /// the same single row.
    pub fn find_or_create_conversation(&self, a: &UserId, b: &UserId) -> Result<Conversation> {
        find_or_create_on(self.conn(), a, b)
    }

    /// Clear the hide marker for `user` on a conversation, if present.
    /// Idempotent; clearing an absent marker is a no-op.
    pub fn unhide_for_participant(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<()> {
        unhide_on(self.conn(), conversation_id, user)
    }

    /// Hide a conversation from `user`'s own view.  Message data and the
    /// other participant's view are untouched.
    pub fn hide_for_participant(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO conversation_hides (conversation_id, user_id, hidden_at)
             VALUES (?1, ?2, ?3)",
            params![
                conversation_id.0.to_string(),
                user.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Whether `user` currently has the conversation hidden.
    pub fn is_hidden_for(&self, conversation_id: ConversationId, user: &UserId) -> Result<bool> {
        let hidden: bool = self.conn().query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM conversation_hides
                 WHERE conversation_id = ?1 AND user_id = ?2
             )",
            params![conversation_id.0.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(hidden)
    }
}

/// Put a participant pair into canonical (sorted) storage order.
pub(crate) fn canonical_pair<'a>(a: &'a UserId, b: &'a UserId) -> (&'a UserId, &'a UserId) {
    if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    }
}

pub(crate) fn find_or_create_on(
    conn: &Connection,
    a: &UserId,
    b: &UserId,
) -> Result<Conversation> {
    let (first, second) = canonical_pair(a, b);
    let now = Utc::now();

    // The UNIQUE(user_a, user_b) constraint makes concurrent creation
    // collapse onto one row.
    conn.execute(
        "INSERT INTO conversations (id, user_a, user_b, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(user_a, user_b) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            first.as_str(),
            second.as_str(),
            now.to_rfc3339(),
        ],
    )?;

    conn.query_row(
        "SELECT id, user_a, user_b, created_at, updated_at
         FROM conversations
         WHERE user_a = ?1 AND user_b = ?2",
        params![first.as_str(), second.as_str()],
        row_to_conversation,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    })
}

pub(crate) fn unhide_on(
    conn: &Connection,
    conversation_id: ConversationId,
    user: &UserId,
) -> Result<()> {
    conn.execute(
        "DELETE FROM conversation_hides WHERE conversation_id = ?1 AND user_id = ?2",
        params![conversation_id.0.to_string(), user.as_str()],
    )?;
    Ok(())
}

/// Map a `rusqlite::Row` to a [`Conversation`].
pub(crate) fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let user_a: String = row.get(1)?;
    let user_b: String = row.get(2)?;
    let created_str: String = row.get(3)?;
    let updated_str: String = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Conversation {
        id: ConversationId(id),
        user_a: UserId::new(user_a),
        user_b: UserId::new(user_b),
        created_at,
        updated_at,
    })
}
