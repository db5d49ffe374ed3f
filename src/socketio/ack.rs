/// Pending acknowledgements for server-initiated emits
use crate::socketio::Payload;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Invoked at most once with the client's acknowledgement arguments
pub type AckCallback = Box<dyn FnOnce(Payload) + Send>;

struct PendingAck {
    sid: String,
    namespace: String,
    created_at: Instant,
    callback: AckCallback,
}

pub struct AckTracker {
    next_id: AtomicU64,
    // Callbacks are Send but not Sync
    pending_acks: Arc<Mutex<HashMap<u64, PendingAck>>>,
    timeout: Duration,
}

impl AckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn next_ack_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn register(&self, id: u64, sid: &str, namespace: &str, callback: AckCallback) {
        let mut pending = self.pending_acks.lock().await;
        pending.insert(
            id,
            PendingAck {
                sid: sid.to_string(),
                namespace: namespace.to_string(),
                created_at: Instant::now(),
                callback,
            },
        );
    }

    /// Complete a pending acknowledgement. Returns false when the id is
    /// unknown or was issued to a different session or namespace.
    pub async fn process_ack(&self, sid: &str, namespace: &str, id: u64, data: Payload) -> bool {
        let ack = {
            let mut pending = self.pending_acks.lock().await;
            match pending.get(&id) {
                Some(ack) if ack.sid == sid && ack.namespace == namespace => pending.remove(&id),
                _ => None,
            }
        };

        let Some(ack) = ack else {
            tracing::debug!("Ignoring ack {} from {} in {}", id, sid, namespace);
            return false;
        };

        if catch_unwind(AssertUnwindSafe(move || (ack.callback)(data))).is_err() {
            tracing::error!("Ack callback {} for session {} panicked", id, sid);
        }
        true
    }

    /// Withdraw an acknowledgement whose event never left the server
    pub async fn cancel(&self, id: u64) -> bool {
        self.pending_acks.lock().await.remove(&id).is_some()
    }

    /// Drop every acknowledgement still owed to a disconnecting session
    pub async fn discard_session(&self, sid: &str) -> usize {
        let mut pending = self.pending_acks.lock().await;
        let before = pending.len();
        pending.retain(|_, ack| ack.sid != sid);
        before - pending.len()
    }

    /// Drop acknowledgements owed by one namespace activation
    pub async fn discard_namespace(&self, sid: &str, namespace: &str) -> usize {
        let mut pending = self.pending_acks.lock().await;
        let before = pending.len();
        pending.retain(|_, ack| ack.sid != sid || ack.namespace != namespace);
        before - pending.len()
    }

    /// Drop acknowledgements older than the configured timeout
    pub async fn cleanup_expired(&self) -> usize {
        let mut pending = self.pending_acks.lock().await;
        let now = Instant::now();
        let before = pending.len();
        pending.retain(|_, ack| now.duration_since(ack.created_at) < self.timeout);
        before - pending.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending_acks.lock().await.len()
    }
}
