/// Physical client connection
///
/// A `Connection` is the core's only handle on the transport: it can queue an
/// outbound frame and ask for the link to be closed. The transport owns the
/// receiving half of the queue and writes frames to the wire.
use crate::error::SocketError;
use crate::socketio::protocol::{EnginePacket, SocketPacket};
use actix_web::web::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

pub type Sid = String;

/// Work item for the transport writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    /// Reply to a WebSocket-level ping
    Pong(Bytes),
    Close,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    sid: Sid,
    sender: mpsc::UnboundedSender<Outbound>,
    /// Frames held back per namespace while its `connect` hook runs
    pending: Mutex<HashMap<String, Vec<String>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("sid", &self.inner.sid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(sid: impl Into<Sid>) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                sid: sid.into(),
                sender,
                pending: Mutex::new(HashMap::new()),
            }),
        };
        (connection, receiver)
    }

    pub fn id(&self) -> &str {
        &self.inner.sid
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }

    /// Queue a Socket.IO packet, holding it back if its namespace is still activating
    pub fn send_packet(&self, packet: &SocketPacket) -> Result<(), SocketError> {
        let frame = EnginePacket::message(packet.encode()).encode();

        let mut pending = self.pending();
        if let Some(buffer) = pending.get_mut(&packet.namespace) {
            buffer.push(frame);
            return Ok(());
        }

        self.push(Outbound::Frame(frame))
    }

    /// Queue an Engine.IO packet, bypassing namespace gating
    pub fn send_engine(&self, packet: &EnginePacket) -> Result<(), SocketError> {
        self.push(Outbound::Frame(packet.encode()))
    }

    pub(crate) fn send_ws_pong(&self, payload: Bytes) -> Result<(), SocketError> {
        self.push(Outbound::Pong(payload))
    }

    pub fn close(&self) {
        // The writer may already be gone; closing twice is harmless
        let _ = self.inner.sender.send(Outbound::Close);
    }

    /// Start holding back frames addressed to `namespace`
    pub(crate) fn begin_activation(&self, namespace: &str) {
        self.pending().insert(namespace.to_string(), Vec::new());
    }

    /// Send the CONNECT reply, then everything emitted while the hook ran
    pub(crate) fn complete_activation(&self, namespace: &str) -> Result<(), SocketError> {
        let mut pending = self.pending();
        let buffered = pending.remove(namespace).unwrap_or_default();

        let reply = SocketPacket::connect(namespace, self.id());
        self.push(Outbound::Frame(EnginePacket::message(reply.encode()).encode()))?;
        for frame in buffered {
            self.push(Outbound::Frame(frame))?;
        }
        Ok(())
    }

    /// Drop anything emitted while the hook ran and send CONNECT_ERROR instead
    pub(crate) fn abort_activation(&self, namespace: &str, reason: &str) {
        let mut pending = self.pending();
        let dropped = pending.remove(namespace).map(|b| b.len()).unwrap_or(0);
        if dropped > 0 {
            tracing::debug!(
                "Discarded {} frames for refused activation of {} on {}",
                dropped,
                namespace,
                self.id()
            );
        }

        let refusal = SocketPacket::connect_error(namespace, reason);
        if let Err(e) = self.push(Outbound::Frame(EnginePacket::message(refusal.encode()).encode()))
        {
            tracing::debug!("Could not deliver refusal: {}", e);
        }
    }

    fn push(&self, item: Outbound) -> Result<(), SocketError> {
        self.inner
            .sender
            .send(item)
            .map_err(|_| SocketError::Delivery(self.inner.sid.clone()))
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
