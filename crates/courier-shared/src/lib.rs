//! # courier-shared
//!
//! Identifiers, message bodies and the realtime event protocol shared
//! between the Courier server and its clients.
//!
//! The types here are transport-agnostic: the server's gateway encodes
//! them as JSON over WebSocket, but nothing in this crate depends on
//! the transport.

pub mod protocol;
pub mod types;

pub use protocol::{ClientEvent, ServerEvent, StatusEntry, WireMessage};
pub use types::{
    ConnectionId, ConversationId, DeliveryStatus, MessageBody, MessageId, UserId,
};
