//! External collaborator boundaries consumed by the core
//!
//! The capacity/quality probe, the ground-truth roster provider, and the
//! friendship verifier all live outside this service. They are modelled as
//! traits here so the core can be exercised against in-memory implementations.

use crate::types::{PlayerId, ServerKey, ServerSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Live capacity/quality probe plus best-effort roster lookup for a server
#[async_trait]
pub trait ServerProbe: Send + Sync {
    /// Fetch a fresh capacity/quality snapshot. `None` means the server did
    /// not respond within the timeout and must simply be skipped this pass.
    async fn snapshot(&self, server: &ServerKey, timeout: Duration) -> Option<ServerSnapshot>;

    /// Fetch the set of occupant names currently on the server. `None` means
    /// ground truth is unavailable; callers treat joining players as confirmed.
    async fn occupant_names(
        &self,
        server: &ServerKey,
        timeout: Duration,
    ) -> Option<HashSet<String>>;
}

/// External friendship verification used for friends-only parties
#[async_trait]
pub trait FriendshipVerifier: Send + Sync {
    async fn are_friends(&self, a: &PlayerId, b: &PlayerId) -> bool;
}

/// In-memory probe with scripted responses, used in tests and as the default
/// provider until a real status poller is wired in.
#[derive(Debug, Default)]
pub struct MockServerProbe {
    snapshots: Mutex<HashMap<ServerKey, ServerSnapshot>>,
    rosters: Mutex<HashMap<ServerKey, HashSet<String>>>,
    unreachable: Mutex<HashSet<ServerKey>>,
}

impl MockServerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the snapshot a server will report
    pub fn set_snapshot(&self, server: &str, snapshot: ServerSnapshot) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.insert(server.to_string(), snapshot);
        }
    }

    /// Script the roster a server will report
    pub fn set_roster(&self, server: &str, names: impl IntoIterator<Item = String>) {
        if let Ok(mut rosters) = self.rosters.lock() {
            rosters.insert(server.to_string(), names.into_iter().collect());
        }
    }

    /// Add a single occupant name to a server's roster
    pub fn add_occupant(&self, server: &str, name: &str) {
        if let Ok(mut rosters) = self.rosters.lock() {
            rosters
                .entry(server.to_string())
                .or_default()
                .insert(name.to_string());
        }
    }

    /// Mark a server as unreachable (snapshot and roster both return None)
    pub fn set_unreachable(&self, server: &str, value: bool) {
        if let Ok(mut unreachable) = self.unreachable.lock() {
            if value {
                unreachable.insert(server.to_string());
            } else {
                unreachable.remove(server);
            }
        }
    }

    fn is_unreachable(&self, server: &ServerKey) -> bool {
        self.unreachable
            .lock()
            .map(|set| set.contains(server))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ServerProbe for MockServerProbe {
    async fn snapshot(&self, server: &ServerKey, _timeout: Duration) -> Option<ServerSnapshot> {
        if self.is_unreachable(server) {
            return None;
        }
        self.snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.get(server).copied())
    }

    async fn occupant_names(
        &self,
        server: &ServerKey,
        _timeout: Duration,
    ) -> Option<HashSet<String>> {
        if self.is_unreachable(server) {
            return None;
        }
        self.rosters
            .lock()
            .ok()
            .and_then(|rosters| rosters.get(server).cloned())
    }
}

/// Verifier that treats everyone as friends; the permissive default
#[derive(Debug, Default)]
pub struct AllowAllVerifier;

#[async_trait]
impl FriendshipVerifier for AllowAllVerifier {
    async fn are_friends(&self, _a: &PlayerId, _b: &PlayerId) -> bool {
        true
    }
}

/// In-memory verifier with an explicit friendship set, for tests
#[derive(Debug, Default)]
pub struct StaticFriendshipVerifier {
    pairs: Mutex<HashSet<(PlayerId, PlayerId)>>,
}

impl StaticFriendshipVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_friendship(&self, a: &str, b: &str) {
        if let Ok(mut pairs) = self.pairs.lock() {
            pairs.insert((a.to_string(), b.to_string()));
            pairs.insert((b.to_string(), a.to_string()));
        }
    }
}

#[async_trait]
impl FriendshipVerifier for StaticFriendshipVerifier {
    async fn are_friends(&self, a: &PlayerId, b: &PlayerId) -> bool {
        self.pairs
            .lock()
            .map(|pairs| pairs.contains(&(a.clone(), b.clone())))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_probe_snapshot_and_roster() {
        let probe = MockServerProbe::new();
        probe.set_snapshot(
            "s1",
            ServerSnapshot {
                free_slots: 10,
                occupants: 2,
                score: 500,
            },
        );
        probe.add_occupant("s1", "alice");

        let snap = probe
            .snapshot(&"s1".to_string(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(snap.free_slots, 10);

        let roster = probe
            .occupant_names(&"s1".to_string(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(roster.contains("alice"));

        // Unknown server has no snapshot
        assert!(probe
            .snapshot(&"s2".to_string(), Duration::from_millis(100))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_excluded() {
        let probe = MockServerProbe::new();
        probe.set_snapshot("s1", ServerSnapshot::empty(8));
        probe.set_unreachable("s1", true);

        assert!(probe
            .snapshot(&"s1".to_string(), Duration::from_millis(100))
            .await
            .is_none());

        probe.set_unreachable("s1", false);
        assert!(probe
            .snapshot(&"s1".to_string(), Duration::from_millis(100))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_static_friendship_is_symmetric() {
        let verifier = StaticFriendshipVerifier::new();
        verifier.add_friendship("a", "b");

        assert!(verifier.are_friends(&"a".to_string(), &"b".to_string()).await);
        assert!(verifier.are_friends(&"b".to_string(), &"a".to_string()).await);
        assert!(!verifier.are_friends(&"a".to_string(), &"c".to_string()).await);
    }
}
