//! Ephemeral presence registry.
//!
//! Process-wide mapping from open connections to the users they announced.
//! Advisory only: reachability can be stale by the time a message lands,
//! and durable truth always lives in the store.  The whole registry dies
//! with the process; clients rebuild it by re-announcing on reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use courier_shared::types::{ConnectionId, UserId};

/// Cloneable handle to the in-memory presence table.
///
/// Constructed once in `main` and injected into the engines; never a
/// global static.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<ConnectionId, UserId>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `connection` belongs to `user`.  A connection carries
    /// at most one identity; re-announcing overwrites (last writer wins).
    pub async fn announce(&self, connection: ConnectionId, user: UserId) {
        let mut map = self.inner.lock().await;
        let previous = map.insert(connection, user.clone());
        if previous.as_ref() != Some(&user) {
            debug!(connection = %connection, user = %user, "presence announced");
        }
    }

    /// Remove the mapping for `connection` if present (idempotent).
    ///
    /// Returns `true` when the withdrawal actually changed reachability,
    /// i.e. no other connection remains for that user.
    pub async fn withdraw(&self, connection: ConnectionId) -> bool {
        let mut map = self.inner.lock().await;
        let Some(user) = map.remove(&connection) else {
            return false;
        };

        let still_reachable = map.values().any(|u| *u == user);
        if !still_reachable {
            debug!(connection = %connection, user = %user, "presence withdrawn");
        }
        !still_reachable
    }

    /// Whether at least one open connection has announced `user`.
    pub async fn is_reachable(&self, user: &UserId) -> bool {
        self.inner.lock().await.values().any(|u| u == user)
    }

    /// Sorted snapshot of all currently-online users.
    pub async fn snapshot_online(&self) -> Vec<UserId> {
        let map = self.inner.lock().await;
        let mut online: Vec<UserId> = map.values().cloned().collect();
        online.sort();
        online.dedup();
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announce_makes_user_reachable() {
        let registry = PresenceRegistry::new();
        let alice = UserId::new("alice");

        assert!(!registry.is_reachable(&alice).await);

        registry.announce(ConnectionId::new(), alice.clone()).await;
        assert!(registry.is_reachable(&alice).await);
        assert_eq!(registry.snapshot_online().await, vec![alice]);
    }

    #[tokio::test]
    async fn withdraw_is_idempotent_and_tracks_multi_tab() {
        let registry = PresenceRegistry::new();
        let alice = UserId::new("alice");
        let tab_one = ConnectionId::new();
        let tab_two = ConnectionId::new();

        registry.announce(tab_one, alice.clone()).await;
        registry.announce(tab_two, alice.clone()).await;

        // Closing one tab leaves the user reachable.
        assert!(!registry.withdraw(tab_one).await);
        assert!(registry.is_reachable(&alice).await);

        // Closing the last tab changes reachability.
        assert!(registry.withdraw(tab_two).await);
        assert!(!registry.is_reachable(&alice).await);

        // Withdrawing an unknown connection is a no-op.
        assert!(!registry.withdraw(tab_two).await);
    }

    #[tokio::test]
    async fn reannounce_overwrites_connection_identity() {
        let registry = PresenceRegistry::new();
        let connection = ConnectionId::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        registry.announce(connection, alice.clone()).await;
        registry.announce(connection, bob.clone()).await;

        assert!(!registry.is_reachable(&alice).await);
        assert!(registry.is_reachable(&bob).await);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_and_deduplicated() {
        let registry = PresenceRegistry::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        registry.announce(ConnectionId::new(), bob.clone()).await;
        registry.announce(ConnectionId::new(), alice.clone()).await;
        registry.announce(ConnectionId::new(), alice.clone()).await;

        assert_eq!(registry.snapshot_online().await, vec![alice, bob]);
    }
}
