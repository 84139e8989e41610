//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `conversations`, `conversation_hides`,
//! `messages`, and `chat_summaries`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
--
-- The participant pair is stored canonicalized (user_a < user_b) so a
-- pair maps to exactly one row regardless of lookup order.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    user_a     TEXT NOT NULL,
    user_b     TEXT NOT NULL,
    created_at TEXT NOT NULL,                -- ISO-8601 / RFC-3339
    updated_at TEXT NOT NULL,

    UNIQUE (user_a, user_b)
);

-- ----------------------------------------------------------------
-- Per-participant hide markers
--
-- A participant may hide a conversation from their own chat list
-- without touching any message data or the other participant's view.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversation_hides (
    conversation_id TEXT NOT NULL,            -- FK -> conversations(id)
    user_id         TEXT NOT NULL,
    hidden_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
--
-- Receipt flags are monotonic: seen implies delivered implies sent.
-- client_token de-duplicates network retries of the same send.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,              -- FK -> conversations(id)
    sender          TEXT NOT NULL,
    receiver        TEXT NOT NULL,
    body_text       TEXT,
    file_ref        TEXT,
    link_ref        TEXT,
    client_token    TEXT,
    sent            INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    delivered       INTEGER NOT NULL DEFAULT 0,
    seen            INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

-- Batch receipt updates are indexed rather than list scans.
CREATE INDEX IF NOT EXISTS idx_messages_undelivered
    ON messages(conversation_id, receiver, delivered);

CREATE INDEX IF NOT EXISTS idx_messages_unseen
    ON messages(conversation_id, sender, receiver, seen);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_token
    ON messages(conversation_id, client_token)
    WHERE client_token IS NOT NULL;

-- ----------------------------------------------------------------
-- Chat-list summaries
--
-- One denormalized preview row per (owner, peer), maintained for both
-- participants independently on every send.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_summaries (
    owner      TEXT NOT NULL,
    peer       TEXT NOT NULL,
    preview    TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (owner, peer)
);

CREATE INDEX IF NOT EXISTS idx_chat_summaries_owner
    ON chat_summaries(owner, updated_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
