//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the
//! REST layer as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_shared::types::{ConversationId, MessageBody, MessageId, UserId};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// The durable record of all messages between exactly two users.
///
/// `user_a` and `user_b` hold the participant pair in canonical (sorted)
/// order so the pair is unique regardless of who looked it up first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique conversation identifier.
    pub id: ConversationId,
    /// First participant (canonical order).
    pub user_a: UserId,
    /// Second participant (canonical order).
    pub user_b: UserId,
    /// When the conversation record was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent message activity.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single stored chat message.
///
/// Sender, receiver, body and creation timestamp are immutable; only the
/// receipt flags change, and only forwards (`seen` implies `delivered`
/// implies `sent`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Unique message identifier, assigned by the store.
    pub id: MessageId,
    /// The conversation this message belongs to.
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: MessageBody,
    /// Client-supplied de-duplication token, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    /// Always true once the row exists: the write succeeded.
    pub sent: bool,
    pub delivered: bool,
    pub seen: bool,
    /// Server-assigned creation timestamp.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chat-list summary
// ---------------------------------------------------------------------------

/// Denormalized per-user, per-peer chat-list entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub owner: UserId,
    pub peer: UserId,
    /// Preview of the most recent message (may be a `[file]`/`[link]`
    /// indicator for text-less messages).
    pub preview: String,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Send record
// ---------------------------------------------------------------------------

/// Result of [`Database::record_outgoing`]: everything a caller needs to
/// fan the message out, all derived from a single committed transaction.
///
/// [`Database::record_outgoing`]: crate::Database::record_outgoing
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub conversation: Conversation,
    pub message: StoredMessage,
    /// False when the send was de-duplicated against an earlier retry
    /// carrying the same client token.
    pub fresh: bool,
}
