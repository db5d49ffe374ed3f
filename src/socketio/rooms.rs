/// Room Directory
///
/// Per-namespace room membership (room -> [sids]) with a reverse index
/// (sid -> [rooms]) so that a disconnect does not scan every room.
/// Empty rooms are dropped as soon as their last member leaves.
use crate::socketio::connection::Sid;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct NamespaceRooms {
    rooms: HashMap<String, HashSet<Sid>>,
    memberships: HashMap<Sid, HashSet<String>>,
}

impl NamespaceRooms {
    fn remove_member(&mut self, room: &str, sid: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(sid);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.rooms.is_empty() && self.memberships.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct RoomDirectory {
    namespaces: Arc<RwLock<HashMap<String, NamespaceRooms>>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room, creating it if needed. Joining twice is a no-op.
    pub async fn join(&self, namespace: &str, room: &str, sid: &str) {
        let mut namespaces = self.namespaces.write().await;
        let scope = namespaces.entry(namespace.to_string()).or_default();

        scope
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(sid.to_string());
        scope
            .memberships
            .entry(sid.to_string())
            .or_default()
            .insert(room.to_string());

        tracing::debug!("Session {} joined room {} in {}", sid, room, namespace);
    }

    /// Leave a room. Leaving a room the session is not in is a no-op.
    pub async fn leave(&self, namespace: &str, room: &str, sid: &str) {
        let mut namespaces = self.namespaces.write().await;
        let Some(scope) = namespaces.get_mut(namespace) else {
            return;
        };

        if scope.remove_member(room, sid) {
            tracing::debug!("Session {} left room {} in {}", sid, room, namespace);
        }
        if let Some(joined) = scope.memberships.get_mut(sid) {
            joined.remove(room);
            if joined.is_empty() {
                scope.memberships.remove(sid);
            }
        }
        if scope.is_empty() {
            namespaces.remove(namespace);
        }
    }

    /// Remove a session from every room in a namespace, returning the rooms it left
    pub async fn leave_all(&self, namespace: &str, sid: &str) -> Vec<String> {
        let mut namespaces = self.namespaces.write().await;
        let Some(scope) = namespaces.get_mut(namespace) else {
            return Vec::new();
        };

        let left: Vec<String> = scope
            .memberships
            .remove(sid)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        for room in &left {
            scope.remove_member(room, sid);
        }
        if scope.is_empty() {
            namespaces.remove(namespace);
        }

        tracing::debug!(
            "Session {} left {} rooms in {}",
            sid,
            left.len(),
            namespace
        );
        left
    }

    /// Members of a room; empty for a room that does not exist
    pub async fn members(&self, namespace: &str, room: &str) -> HashSet<Sid> {
        let namespaces = self.namespaces.read().await;
        namespaces
            .get(namespace)
            .and_then(|scope| scope.rooms.get(room))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn rooms_of(&self, namespace: &str, sid: &str) -> HashSet<String> {
        let namespaces = self.namespaces.read().await;
        namespaces
            .get(namespace)
            .and_then(|scope| scope.memberships.get(sid))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        let namespaces = self.namespaces.read().await;
        namespaces.values().map(|scope| scope.rooms.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let rooms = RoomDirectory::new();

        rooms.join("/", "lobby", "a").await;
        rooms.join("/", "lobby", "a").await;
        assert_eq!(rooms.members("/", "lobby").await.len(), 1);

        rooms.leave("/", "lobby", "a").await;
        assert!(rooms.members("/", "lobby").await.is_empty());
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_non_member_is_noop() {
        let rooms = RoomDirectory::new();
        rooms.join("/", "lobby", "a").await;

        rooms.leave("/", "lobby", "b").await;
        rooms.leave("/", "missing", "a").await;
        rooms.leave("/nowhere", "lobby", "a").await;

        assert_eq!(rooms.members("/", "lobby").await.len(), 1);
    }

    #[tokio::test]
    async fn test_net_effect_of_sequences() {
        let rooms = RoomDirectory::new();
        let steps = [true, false, true, true, false, false, true];

        let mut expected = false;
        for join in steps {
            if join {
                rooms.join("/", "r", "s").await;
            } else {
                rooms.leave("/", "r", "s").await;
            }
            expected = join;
            assert_eq!(rooms.members("/", "r").await.contains("s"), expected);
        }
        assert!(expected);
    }

    #[tokio::test]
    async fn test_rooms_are_namespace_scoped() {
        let rooms = RoomDirectory::new();
        rooms.join("/", "lobby", "a").await;
        rooms.join("/chat", "lobby", "b").await;

        assert!(rooms.members("/", "lobby").await.contains("a"));
        assert!(!rooms.members("/", "lobby").await.contains("b"));
        assert!(rooms.members("/chat", "lobby").await.contains("b"));
    }

    #[tokio::test]
    async fn test_leave_all() {
        let rooms = RoomDirectory::new();
        rooms.join("/", "a", "s").await;
        rooms.join("/", "b", "s").await;
        rooms.join("/", "b", "other").await;
        rooms.join("/chat", "a", "s").await;

        let mut left = rooms.leave_all("/", "s").await;
        left.sort();
        assert_eq!(left, vec!["a", "b"]);

        assert!(rooms.members("/", "a").await.is_empty());
        assert_eq!(rooms.members("/", "b").await.len(), 1);
        assert!(rooms.rooms_of("/", "s").await.is_empty());
        // Other namespaces are untouched
        assert!(rooms.members("/chat", "a").await.contains("s"));

        assert!(rooms.leave_all("/", "s").await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_room_is_empty() {
        let rooms = RoomDirectory::new();
        assert!(rooms.members("/", "nope").await.is_empty());
        assert!(rooms.members("/nope", "nope").await.is_empty());
    }
}
