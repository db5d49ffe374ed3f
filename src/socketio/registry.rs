/// Session Registry
///
/// This tracks:
/// - Sessions per namespace (namespace -> sid -> Connection)
/// - Active namespaces per physical client (sid -> [namespace])
///
/// Both maps sit behind one lock so a lookup never observes a session that is
/// present in one index and missing from the other.
use crate::socketio::connection::{Connection, Sid};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    connection: Connection,
    /// False while the namespace's `connect` hook is still deciding
    established: bool,
}

#[derive(Default)]
struct RegistryInner {
    namespaces: HashMap<String, HashMap<Sid, Entry>>,
    clients: HashMap<Sid, HashSet<String>>,
}

/// Outcome of removing one namespace activation
#[derive(Debug, Clone)]
pub struct Unregistered {
    pub connection: Connection,
    /// Whether the `connect` hook had accepted this activation
    pub established: bool,
    /// Whether this was the client's last active namespace
    pub last: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub clients: usize,
    pub namespaces: usize,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending activation. Returns false if the session is already
    /// active in this namespace.
    pub async fn register(&self, sid: &str, connection: Connection, namespace: &str) -> bool {
        let mut inner = self.inner.write().await;

        let sessions = inner.namespaces.entry(namespace.to_string()).or_default();
        if sessions.contains_key(sid) {
            return false;
        }
        sessions.insert(
            sid.to_string(),
            Entry {
                connection,
                established: false,
            },
        );

        inner
            .clients
            .entry(sid.to_string())
            .or_default()
            .insert(namespace.to_string());

        tracing::debug!("Registered session {} in namespace {}", sid, namespace);
        true
    }

    /// Returns false if the activation was torn down while its hook ran
    pub async fn mark_established(&self, sid: &str, namespace: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner
            .namespaces
            .get_mut(namespace)
            .and_then(|sessions| sessions.get_mut(sid))
        {
            Some(entry) => {
                entry.established = true;
                true
            }
            None => false,
        }
    }

    /// Remove one namespace activation. `None` means it was already gone,
    /// which makes duplicate disconnects a no-op.
    pub async fn unregister(&self, sid: &str, namespace: &str) -> Option<Unregistered> {
        let mut inner = self.inner.write().await;

        let sessions = inner.namespaces.get_mut(namespace)?;
        let entry = sessions.remove(sid)?;
        if sessions.is_empty() {
            inner.namespaces.remove(namespace);
        }

        let last = match inner.clients.get_mut(sid) {
            Some(active) => {
                active.remove(namespace);
                active.is_empty()
            }
            None => true,
        };
        if last {
            inner.clients.remove(sid);
        }

        tracing::debug!("Unregistered session {} from namespace {}", sid, namespace);
        Some(Unregistered {
            connection: entry.connection,
            established: entry.established,
            last,
        })
    }

    pub async fn lookup(&self, sid: &str, namespace: &str) -> Option<Connection> {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .get(namespace)
            .and_then(|sessions| sessions.get(sid))
            .map(|entry| entry.connection.clone())
    }

    /// Resolve many sessions under a single read lock, skipping any that are gone
    pub async fn lookup_many<'a>(
        &self,
        namespace: &str,
        sids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<Connection> {
        let inner = self.inner.read().await;
        let Some(sessions) = inner.namespaces.get(namespace) else {
            return Vec::new();
        };
        sids.into_iter()
            .filter_map(|sid| sessions.get(sid))
            .map(|entry| entry.connection.clone())
            .collect()
    }

    pub async fn is_established(&self, sid: &str, namespace: &str) -> bool {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .get(namespace)
            .and_then(|sessions| sessions.get(sid))
            .map(|entry| entry.established)
            .unwrap_or(false)
    }

    /// Snapshot of every session active in a namespace
    pub async fn sessions(&self, namespace: &str) -> Vec<(Sid, Connection)> {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .get(namespace)
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|(sid, entry)| (sid.clone(), entry.connection.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Namespaces that currently have at least one session
    pub async fn namespaces(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.namespaces.keys().cloned().collect()
    }

    pub async fn namespaces_of(&self, sid: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .clients
            .get(sid)
            .map(|active| active.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            sessions: inner.namespaces.values().map(HashMap::len).sum(),
            clients: inner.clients.len(),
            namespaces: inner.namespaces.len(),
        }
    }
}
