/// Fan-out Engine
///
/// Resolves an addressing mode into a concrete set of connections and queues
/// the event on each. Queueing never blocks, so one slow client cannot hold up
/// delivery to the others, and a closed connection is logged and skipped.
use crate::error::SocketError;
use crate::socketio::ack::{AckCallback, AckTracker};
use crate::socketio::connection::{Connection, Sid};
use crate::socketio::metrics::SocketMetrics;
use crate::socketio::protocol::{SocketPacket, DEFAULT_NAMESPACE};
use crate::socketio::registry::SessionRegistry;
use crate::socketio::rooms::RoomDirectory;
use crate::socketio::Payload;
use std::sync::Arc;

/// Who an emission is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One session, by id
    Session(Sid),
    /// Every member of a room in the emission's namespace
    Room(String),
    /// Every session active in the emission's namespace
    NamespaceBroadcast,
    /// Every session in every namespace
    Global,
}

/// An outbound event together with its addressing
pub struct Emission {
    pub(crate) namespace: String,
    pub(crate) event: String,
    pub(crate) payload: Payload,
    pub(crate) target: Target,
    pub(crate) exclude: Option<Sid>,
    pub(crate) callback: Option<AckCallback>,
}

impl std::fmt::Debug for Emission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emission")
            .field("namespace", &self.namespace)
            .field("event", &self.event)
            .field("target", &self.target)
            .field("exclude", &self.exclude)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Emission {
    /// A server-originated emission: default namespace, global target
    pub fn new(event: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            event: event.into(),
            payload: payload.into(),
            target: Target::Global,
            exclude: None,
            callback: None,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn to(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn exclude(mut self, sid: impl Into<Sid>) -> Self {
        self.exclude = Some(sid.into());
        self
    }

    /// Request an acknowledgement. Only valid for a `Target::Session` emission.
    pub fn with_ack<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Payload) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

#[derive(Clone)]
pub struct FanOut {
    registry: SessionRegistry,
    rooms: RoomDirectory,
    acks: Arc<AckTracker>,
    metrics: SocketMetrics,
}

impl FanOut {
    pub fn new(
        registry: SessionRegistry,
        rooms: RoomDirectory,
        acks: Arc<AckTracker>,
        metrics: SocketMetrics,
    ) -> Self {
        Self {
            registry,
            rooms,
            acks,
            metrics,
        }
    }

    /// Deliver an emission, returning how many connections accepted it
    pub async fn deliver(&self, emission: Emission) -> Result<usize, SocketError> {
        let Emission {
            namespace,
            event,
            payload,
            target,
            exclude,
            callback,
        } = emission;
        let exclude = exclude.as_deref();

        if callback.is_some() && !matches!(target, Target::Session(_)) {
            return Err(SocketError::AckRequiresSingleRecipient);
        }

        let sent = match target {
            Target::Session(sid) => {
                if exclude == Some(sid.as_str()) {
                    0
                } else {
                    self.send_to_session(&namespace, &sid, &event, &payload, callback)
                        .await
                }
            }
            Target::Room(room) => {
                self.send_to_room(&namespace, &room, &event, &payload, exclude)
                    .await
            }
            Target::NamespaceBroadcast => {
                self.broadcast_namespace(&namespace, &event, &payload, exclude)
                    .await
            }
            Target::Global => self.broadcast_global(&event, &payload, exclude).await,
        };

        if sent > 0 {
            self.metrics.record_event_sent(&event, sent).await;
        }
        Ok(sent)
    }

    /// Unicast. A session that is gone is not an error: disconnect races are expected.
    pub async fn send_to_session(
        &self,
        namespace: &str,
        sid: &str,
        event: &str,
        payload: &Payload,
        callback: Option<AckCallback>,
    ) -> usize {
        let Some(connection) = self.registry.lookup(sid, namespace).await else {
            tracing::debug!("Session {} not in {}, dropping '{}'", sid, namespace, event);
            return 0;
        };

        let packet = match callback {
            Some(callback) => {
                let ack_id = self.acks.next_ack_id();
                // Registered before sending so a fast reply always finds it
                self.acks.register(ack_id, sid, namespace, callback).await;
                let packet = SocketPacket::event_with_ack(namespace, event, payload, ack_id);
                if !self.deliver_to(&connection, &packet, event).await {
                    self.acks.cancel(ack_id).await;
                    return 0;
                }
                return 1;
            }
            None => SocketPacket::event(namespace, event, payload),
        };

        usize::from(self.deliver_to(&connection, &packet, event).await)
    }

    pub async fn send_to_room(
        &self,
        namespace: &str,
        room: &str,
        event: &str,
        payload: &Payload,
        exclude: Option<&str>,
    ) -> usize {
        let members = self.rooms.members(namespace, room).await;
        let recipients = self
            .registry
            .lookup_many(
                namespace,
                members
                    .iter()
                    .map(String::as_str)
                    .filter(|sid| Some(*sid) != exclude),
            )
            .await;

        let packet = SocketPacket::event(namespace, event, payload);
        self.deliver_all(&recipients, &packet, event).await
    }

    pub async fn broadcast_namespace(
        &self,
        namespace: &str,
        event: &str,
        payload: &Payload,
        exclude: Option<&str>,
    ) -> usize {
        let recipients: Vec<Connection> = self
            .registry
            .sessions(namespace)
            .await
            .into_iter()
            .filter(|(sid, _)| Some(sid.as_str()) != exclude)
            .map(|(_, connection)| connection)
            .collect();

        let packet = SocketPacket::event(namespace, event, payload);
        self.deliver_all(&recipients, &packet, event).await
    }

    /// Every session in every namespace, each addressed in its own namespace
    pub async fn broadcast_global(
        &self,
        event: &str,
        payload: &Payload,
        exclude: Option<&str>,
    ) -> usize {
        let mut sent = 0;
        for namespace in self.registry.namespaces().await {
            sent += self
                .broadcast_namespace(&namespace, event, payload, exclude)
                .await;
        }
        sent
    }

    async fn deliver_all(
        &self,
        recipients: &[Connection],
        packet: &SocketPacket,
        event: &str,
    ) -> usize {
        let mut sent = 0;
        for connection in recipients {
            if self.deliver_to(connection, packet, event).await {
                sent += 1;
            }
        }
        sent
    }

    async fn deliver_to(&self, connection: &Connection, packet: &SocketPacket, event: &str) -> bool {
        match connection.send_packet(packet) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Skipping recipient for '{}': {}", event, e);
                self.metrics.record_event_failed(event).await;
                false
            }
        }
    }
}
