//! Chat-list summaries: one denormalized preview row per (owner, peer).

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use courier_shared::types::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::models::ChatSummary;

impl Database {
    /// Insert or refresh the chat-list entry for `owner` with peer
    /// `peer`.
    pub fn upsert_summary(
        &self,
        owner: &UserId,
        peer: &UserId,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        upsert_on(self.conn(), owner, peer, preview, at)
    }

    /// All chat-list entries for `owner`, most recent activity first.
    pub fn chat_list(&self, owner: &UserId) -> Result<Vec<ChatSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT owner, peer, preview, updated_at
             FROM chat_summaries
             WHERE owner = ?1
             ORDER BY updated_at DESC",
        )?;

        let rows = stmt.query_map(params![owner.as_str()], row_to_summary)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }
}

pub(crate) fn upsert_on(
    conn: &Connection,
    owner: &UserId,
    peer: &UserId,
    preview: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_summaries (owner, peer, preview, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(owner, peer) DO UPDATE SET
             preview = excluded.preview,
             updated_at = excluded.updated_at",
        params![owner.as_str(), peer.as_str(), preview, at.to_rfc3339()],
    )?;
    Ok(())
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSummary> {
    let owner: String = row.get(0)?;
    let peer: String = row.get(1)?;
    let preview: String = row.get(2)?;
    let ts_str: String = row.get(3)?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ChatSummary {
        owner: UserId::new(owner),
        peer: UserId::new(peer),
        preview,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_test_db(dir: &tempfile::TempDir) -> Database {
        Database::open_at(&dir.path().join("test.db")).unwrap()
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);

        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let t0 = Utc::now();

        db.upsert_summary(&alice, &bob, "hi", t0).unwrap();
        db.upsert_summary(&alice, &bob, "newer", t0 + Duration::seconds(5))
            .unwrap();

        let list = db.chat_list(&alice).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].preview, "newer");
    }

    #[test]
    fn chat_list_is_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_test_db(&dir);

        let alice = UserId::new("alice");
        let t0 = Utc::now();

        db.upsert_summary(&alice, &UserId::new("bob"), "old", t0)
            .unwrap();
        db.upsert_summary(
            &alice,
            &UserId::new("carol"),
            "new",
            t0 + Duration::seconds(10),
        )
        .unwrap();

        let list = db.chat_list(&alice).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].peer.as_str(), "carol");
        assert_eq!(list[1].peer.as_str(), "bob");
    }
}
