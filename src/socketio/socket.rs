/// Handler context bound to one session in one namespace
use crate::error::SocketError;
use crate::socketio::connection::Sid;
use crate::socketio::fanout::{Emission, Target};
use crate::socketio::namespace::DisconnectReason;
use crate::socketio::protocol::SocketPacket;
use crate::socketio::server::Server;
use crate::socketio::Payload;
use std::collections::HashSet;

#[derive(Clone)]
pub struct Socket {
    sid: Sid,
    namespace: String,
    server: Server,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(sid: impl Into<Sid>, namespace: impl Into<String>, server: Server) -> Self {
        Self {
            sid: sid.into(),
            namespace: namespace.into(),
            server,
        }
    }

    pub fn id(&self) -> &str {
        &self.sid
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Emit to this session only
    pub async fn emit(
        &self,
        event: &str,
        payload: impl Into<Payload>,
    ) -> Result<usize, SocketError> {
        self.server
            .emit(self.emission(event, payload).to(Target::Session(self.sid.clone())))
            .await
    }

    /// Emit to this session and run `callback` with the client's acknowledgement
    pub async fn emit_with_ack<F>(
        &self,
        event: &str,
        payload: impl Into<Payload>,
        callback: F,
    ) -> Result<usize, SocketError>
    where
        F: FnOnce(Payload) + Send + 'static,
    {
        self.server
            .emit(
                self.emission(event, payload)
                    .to(Target::Session(self.sid.clone()))
                    .with_ack(callback),
            )
            .await
    }

    /// Unnamed text message to this session
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<usize, SocketError> {
        self.emit("message", payload).await
    }

    /// Unnamed JSON message to this session
    pub async fn send_json(&self, payload: impl Into<Payload>) -> Result<usize, SocketError> {
        self.emit("json", payload).await
    }

    /// Address a room in this namespace. The sender is included unless
    /// `except_self` is called.
    pub fn to(&self, room: impl Into<String>) -> Operator {
        Operator::new(self.clone(), Target::Room(room.into()))
    }

    /// Address every session in this namespace
    pub fn broadcast(&self) -> Operator {
        Operator::new(self.clone(), Target::NamespaceBroadcast)
    }

    pub async fn join(&self, room: &str) -> Result<bool, SocketError> {
        self.server.join_room(&self.namespace, &self.sid, room).await
    }

    pub async fn leave(&self, room: &str) -> Result<(), SocketError> {
        self.server.leave_room(&self.namespace, &self.sid, room).await
    }

    /// Rooms this session belongs to here, its private room included
    pub async fn rooms(&self) -> HashSet<String> {
        self.server.rooms_of(&self.namespace, &self.sid).await
    }

    /// Server-side namespace disconnect. The client is told before teardown.
    pub async fn disconnect(&self) -> bool {
        if let Some(connection) = self.server.connection(&self.sid, &self.namespace).await {
            if let Err(e) = connection.send_packet(&SocketPacket::disconnect(&self.namespace)) {
                tracing::debug!("Could not notify {} of disconnect: {}", self.sid, e);
            }
        }
        self.server
            .disconnect_namespace(
                &self.sid,
                &self.namespace,
                DisconnectReason::ServerNamespaceDisconnect,
            )
            .await
    }

    fn emission(&self, event: &str, payload: impl Into<Payload>) -> Emission {
        Emission::new(event, payload).namespace(self.namespace.clone())
    }
}

/// A room or namespace addressed from inside a handler
#[derive(Debug, Clone)]
pub struct Operator {
    socket: Socket,
    target: Target,
    exclude_self: bool,
}

impl Operator {
    fn new(socket: Socket, target: Target) -> Self {
        Self {
            socket,
            target,
            exclude_self: false,
        }
    }

    pub fn except_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    pub async fn emit(
        &self,
        event: &str,
        payload: impl Into<Payload>,
    ) -> Result<usize, SocketError> {
        let mut emission = self.socket.emission(event, payload).to(self.target.clone());
        if self.exclude_self {
            emission = emission.exclude(self.socket.sid.clone());
        }
        self.socket.server.emit(emission).await
    }

    pub async fn send(&self, payload: impl Into<Payload>) -> Result<usize, SocketError> {
        self.emit("message", payload).await
    }

    pub async fn send_json(&self, payload: impl Into<Payload>) -> Result<usize, SocketError> {
        self.emit("json", payload).await
    }
}
