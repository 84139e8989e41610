use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, DeliveryStatus, MessageBody, MessageId, UserId};

/// Events a client sends to the gateway over its realtime connection.
///
/// Identity fields are trusted as-is: authentication happens before the
/// connection reaches the gateway and is not re-checked here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Announce that the connection belongs to an online user.
    AnnouncePresence { user_id: UserId },

    /// Subscribe this connection to notifications addressed to `user_id`.
    JoinRoom { user_id: UserId },

    /// Send a chat message to another user.
    SendMessage {
        sender_id: UserId,
        receiver_id: UserId,
        body: MessageBody,
        /// Optional client-generated token used to de-duplicate retries.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_token: Option<String>,
    },

    /// Mark a single message as delivered.
    MarkDelivered {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// Mark a single message as seen (implies delivered).
    MarkSeen {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    /// Mark every unseen message from `peer_id` to `user_id` as seen.
    MarkAllSeen {
        conversation_id: ConversationId,
        user_id: UserId,
        peer_id: UserId,
    },

    /// Mark every undelivered message addressed to `user_id` as delivered.
    MarkAllDelivered {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

/// Events the gateway pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// A new message, pushed to both the sender (echo/confirmation) and
    /// the receiver.  Each side gets its own `status` value.
    MessageReceived {
        conversation_id: ConversationId,
        message: WireMessage,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
    },

    /// One or more messages in a conversation changed receipt status.
    /// Addressed to the messages' original sender.
    StatusChanged {
        conversation_id: ConversationId,
        updates: Vec<StatusEntry>,
    },

    /// Broadcast of the full set of currently-online users.
    PresenceChanged { online: Vec<UserId> },

    /// A send was rejected before anything was stored.  Addressed to the
    /// originating connection only.
    SendRejected { reason: String },
}

/// Outbound copy of a stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
}

/// A single receipt transition inside a [`ServerEvent::StatusChanged`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

impl ClientEvent {
    /// Decode an inbound event from its JSON text frame.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl ServerEvent {
    /// Encode an outbound event as a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
