//! # courier-store
//!
//! Durable message log for the Courier messaging service, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for conversations,
//! messages, hide markers and chat-list summaries.  Receipt flags are
//! updated with guarded SQL so a stale in-memory copy can never move a
//! flag backwards.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod summaries;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
