/// Socket.IO Server
///
/// The process-wide entry point: a cheaply cloneable handle owning the
/// namespace table, the session registry, the room directory and the fan-out
/// engine. The namespace table is fixed once `ServerBuilder::build` returns.
use crate::config::Config;
use crate::error::SocketError;
use crate::socketio::ack::AckTracker;
use crate::socketio::connection::{Connection, Sid};
use crate::socketio::fanout::{Emission, FanOut, Target};
use crate::socketio::metrics::{MetricsSnapshot, SocketMetrics};
use crate::socketio::namespace::{
    ConnectionRefused, DisconnectReason, ErrorHandler, HandlerFailure, Namespace,
};
use crate::socketio::protocol::{SocketPacket, DEFAULT_NAMESPACE};
use crate::socketio::registry::SessionRegistry;
use crate::socketio::rooms::RoomDirectory;
use crate::socketio::socket::Socket;
use crate::socketio::Payload;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

pub struct ServerBuilder {
    config: Config,
    namespaces: HashMap<String, Namespace>,
    /// Paths registered as a whole `Namespace`; they take no individual handlers
    sealed: HashSet<String>,
    default_error: Option<ErrorHandler>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            namespaces: HashMap::new(),
            sealed: HashSet::new(),
            default_error: None,
        }
    }

    /// Register a complete namespace (class style)
    pub fn namespace(mut self, namespace: Namespace) -> Result<Self, SocketError> {
        let path = namespace.path().to_string();
        validate_path(&path)?;
        if self.namespaces.contains_key(&path) {
            return Err(SocketError::configuration(format!(
                "Namespace {} registered twice",
                path
            )));
        }
        self.sealed.insert(path.clone());
        self.namespaces.insert(path, namespace);
        Ok(self)
    }

    pub fn on<F, Fut, R>(self, path: &str, event: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Payload> + 'static,
    {
        self.update(path, |ns| ns.on(event, handler))
    }

    pub fn on_message<F, Fut, R>(self, path: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Payload> + 'static,
    {
        self.update(path, |ns| ns.on_message(handler))
    }

    pub fn on_json<F, Fut, R>(self, path: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Payload> + 'static,
    {
        self.update(path, |ns| ns.on_json(handler))
    }

    pub fn on_connect<F, Fut>(self, path: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Option<JsonValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectionRefused>> + Send + 'static,
    {
        self.update(path, |ns| ns.on_connect(handler))
    }

    pub fn on_disconnect<F, Fut>(self, path: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, DisconnectReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.update(path, |ns| ns.on_disconnect(handler))
    }

    pub fn on_error<F>(self, path: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(&HandlerFailure) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.update(path, |ns| ns.on_error(handler))
    }

    /// Error hook for namespaces that have none of their own
    pub fn on_default_error<F>(mut self, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(&HandlerFailure) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if self.default_error.is_some() {
            return Err(SocketError::configuration(
                "Default error handler registered twice",
            ));
        }
        self.default_error = Some(Arc::new(handler));
        Ok(self)
    }

    pub fn build(mut self) -> Server {
        self.namespaces
            .entry(DEFAULT_NAMESPACE.to_string())
            .or_insert_with(|| Namespace::new(DEFAULT_NAMESPACE));

        let registry = SessionRegistry::new();
        let rooms = RoomDirectory::new();
        let acks = Arc::new(AckTracker::new(self.config.ack_timeout()));
        let metrics = SocketMetrics::new();
        let fanout = FanOut::new(
            registry.clone(),
            rooms.clone(),
            acks.clone(),
            metrics.clone(),
        );

        let mut paths: Vec<&String> = self.namespaces.keys().collect();
        paths.sort();
        tracing::info!("Socket.IO namespaces: {:?}", paths);

        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                namespaces: self.namespaces,
                default_error: self.default_error,
                registry,
                rooms,
                acks,
                fanout,
                metrics,
            }),
        }
    }

    fn update(
        mut self,
        path: &str,
        f: impl FnOnce(Namespace) -> Result<Namespace, SocketError>,
    ) -> Result<Self, SocketError> {
        validate_path(path)?;
        if self.sealed.contains(path) {
            return Err(SocketError::configuration(format!(
                "Namespace {} was registered as a whole and cannot take individual handlers",
                path
            )));
        }

        let namespace = self
            .namespaces
            .remove(path)
            .unwrap_or_else(|| Namespace::new(path));
        self.namespaces.insert(path.to_string(), f(namespace)?);
        Ok(self)
    }
}

fn validate_path(path: &str) -> Result<(), SocketError> {
    if !path.starts_with('/') {
        return Err(SocketError::configuration(format!(
            "Namespace path must start with '/': {}",
            path
        )));
    }
    Ok(())
}

struct ServerInner {
    config: Config,
    namespaces: HashMap<String, Namespace>,
    default_error: Option<ErrorHandler>,
    registry: SessionRegistry,
    rooms: RoomDirectory,
    acks: Arc<AckTracker>,
    fanout: FanOut,
    metrics: SocketMetrics,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub sessions: usize,
    pub clients: usize,
    pub rooms: usize,
    pub namespaces: Vec<String>,
    pub pending_acks: usize,
    pub metrics: MetricsSnapshot,
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> &SocketMetrics {
        &self.inner.metrics
    }

    pub(crate) fn acks(&self) -> &AckTracker {
        &self.inner.acks
    }

    pub fn namespace(&self, path: &str) -> Option<&Namespace> {
        self.inner.namespaces.get(path)
    }

    pub fn namespace_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.namespaces.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Server-originated emit. Returns the number of connections reached.
    pub async fn emit(&self, emission: Emission) -> Result<usize, SocketError> {
        if *emission.target() != Target::Global {
            self.require_namespace(&emission.namespace)?;
        }
        self.inner.fanout.deliver(emission).await
    }

    /// Unnamed text message (`message` event)
    pub async fn send(
        &self,
        namespace: &str,
        payload: impl Into<Payload>,
        target: Target,
        exclude: Option<&str>,
    ) -> Result<usize, SocketError> {
        self.emit(unnamed("message", namespace, payload, target, exclude))
            .await
    }

    /// Unnamed JSON message (`json` event)
    pub async fn send_json(
        &self,
        namespace: &str,
        payload: impl Into<Payload>,
        target: Target,
        exclude: Option<&str>,
    ) -> Result<usize, SocketError> {
        self.emit(unnamed("json", namespace, payload, target, exclude))
            .await
    }

    pub async fn broadcast_global(
        &self,
        event: &str,
        payload: impl Into<Payload>,
    ) -> Result<usize, SocketError> {
        self.emit(Emission::new(event, payload)).await
    }

    /// Add a session to a room. Returns false if the session is not active in
    /// the namespace.
    pub async fn join_room(
        &self,
        namespace: &str,
        sid: &str,
        room: &str,
    ) -> Result<bool, SocketError> {
        self.require_namespace(namespace)?;
        if self.inner.registry.lookup(sid, namespace).await.is_none() {
            tracing::debug!("Session {} not in {}, cannot join {}", sid, namespace, room);
            return Ok(false);
        }

        self.inner.rooms.join(namespace, room, sid).await;

        // A disconnect may have cleared this session's rooms between the
        // lookup and the join
        if self.inner.registry.lookup(sid, namespace).await.is_none() {
            self.inner.rooms.leave(namespace, room, sid).await;
            return Ok(false);
        }
        Ok(true)
    }

    /// Remove a session from a room. A session's private room is kept for as
    /// long as it is active in the namespace.
    pub async fn leave_room(
        &self,
        namespace: &str,
        sid: &str,
        room: &str,
    ) -> Result<(), SocketError> {
        self.require_namespace(namespace)?;
        if room == sid && self.inner.registry.lookup(sid, namespace).await.is_some() {
            tracing::debug!("Session {} cannot leave its own room in {}", sid, namespace);
            return Ok(());
        }
        self.inner.rooms.leave(namespace, room, sid).await;
        Ok(())
    }

    pub async fn members(&self, namespace: &str, room: &str) -> HashSet<Sid> {
        self.inner.rooms.members(namespace, room).await
    }

    pub async fn rooms_of(&self, namespace: &str, sid: &str) -> HashSet<String> {
        self.inner.rooms.rooms_of(namespace, sid).await
    }

    pub(crate) async fn connection(&self, sid: &str, namespace: &str) -> Option<Connection> {
        self.inner.registry.lookup(sid, namespace).await
    }

    pub(crate) async fn is_established(&self, sid: &str, namespace: &str) -> bool {
        self.inner.registry.is_established(sid, namespace).await
    }

    /// Activate a namespace for a connection, running its `connect` hook.
    /// Frames emitted to the session while the hook runs reach the client only
    /// after the CONNECT reply, and are dropped if the hook refuses.
    pub(crate) async fn activate(
        &self,
        connection: &Connection,
        namespace: &str,
        auth: Option<JsonValue>,
    ) {
        let sid = connection.id().to_string();

        let Some(ns) = self.inner.namespaces.get(namespace) else {
            tracing::warn!("Session {} requested unknown namespace {}", sid, namespace);
            connection.abort_activation(namespace, "Invalid namespace");
            return;
        };

        if self.inner.registry.lookup(&sid, namespace).await.is_some() {
            tracing::warn!("Session {} already active in {}, ignoring CONNECT", sid, namespace);
            return;
        }

        connection.begin_activation(namespace);
        self.inner
            .registry
            .register(&sid, connection.clone(), namespace)
            .await;
        self.inner.rooms.join(namespace, &sid, &sid).await;

        let outcome = match ns.connect_handler() {
            Some(hook) => {
                let socket = Socket::new(sid.clone(), namespace, self.clone());
                match AssertUnwindSafe(hook(socket, auth)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.report_failure(HandlerFailure {
                            sid: sid.clone(),
                            namespace: namespace.to_string(),
                            event: "connect".to_string(),
                            error: anyhow::anyhow!("connect handler panicked"),
                        })
                        .await;
                        Err(ConnectionRefused::without_reason())
                    }
                }
            }
            None => Ok(()),
        };

        let outcome = match outcome {
            Ok(()) if !self.inner.registry.mark_established(&sid, namespace).await => {
                // Torn down from inside its own hook
                Err(ConnectionRefused::without_reason())
            }
            other => other,
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = connection.complete_activation(namespace) {
                    tracing::debug!("CONNECT reply for {} not delivered: {}", namespace, e);
                }
                self.inner.metrics.record_connection().await;
                tracing::info!("Session {} connected to {}", sid, namespace);
            }
            Err(refused) => {
                self.inner.registry.unregister(&sid, namespace).await;
                self.inner.rooms.leave_all(namespace, &sid).await;
                self.inner.acks.discard_namespace(&sid, namespace).await;
                connection.abort_activation(namespace, refused.message());
                self.inner.metrics.record_refused().await;
                tracing::info!("Session {} refused by {}: {}", sid, namespace, refused);
            }
        }
    }

    /// Tear down one namespace activation. Returns false if it was already
    /// gone. Rooms are released before the `disconnect` hook runs.
    pub async fn disconnect_namespace(
        &self,
        sid: &str,
        namespace: &str,
        reason: DisconnectReason,
    ) -> bool {
        let Some(removed) = self.inner.registry.unregister(sid, namespace).await else {
            return false;
        };

        self.inner.rooms.leave_all(namespace, sid).await;
        self.inner.acks.discard_namespace(sid, namespace).await;

        if removed.established {
            self.inner.metrics.record_disconnection().await;

            if let Some(hook) = self
                .inner
                .namespaces
                .get(namespace)
                .and_then(|ns| ns.disconnect_handler())
            {
                let socket = Socket::new(sid, namespace, self.clone());
                if AssertUnwindSafe(hook(socket, reason))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    tracing::error!("disconnect handler in {} panicked for {}", namespace, sid);
                }
            }
        }

        if removed.last {
            self.inner.acks.discard_session(sid).await;
            removed.connection.close();
        }

        tracing::info!("Session {} disconnected from {} ({})", sid, namespace, reason);
        true
    }

    /// Tear down every namespace a session has active. Safe to call repeatedly.
    pub async fn disconnect(&self, sid: &str, reason: DisconnectReason) -> usize {
        let mut count = 0;
        for namespace in self.inner.registry.namespaces_of(sid).await {
            if self.disconnect_namespace(sid, &namespace, reason).await {
                count += 1;
            }
        }
        count
    }

    /// Route a handler failure to the namespace error hook, then the default
    /// hook, then the log. Failing hooks are logged and swallowed.
    pub(crate) async fn report_failure(&self, failure: HandlerFailure) {
        self.inner.metrics.record_event_failed(&failure.event).await;

        let hook = self
            .inner
            .namespaces
            .get(&failure.namespace)
            .and_then(|ns| ns.error_handler())
            .or(self.inner.default_error.as_ref());

        let Some(hook) = hook else {
            let error = SocketError::from(failure);
            tracing::error!("{:#}", anyhow::Error::from(error));
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| hook(&failure))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("Error handler for {} failed: {:#}", failure.namespace, e)
            }
            Err(_) => tracing::error!("Error handler for {} panicked", failure.namespace),
        }
    }

    /// Periodically discard acknowledgements the client never answered
    pub fn spawn_ack_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let acks = self.inner.acks.clone();
        let period = self.inner.config.ack_timeout().max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = acks.cleanup_expired().await;
                if expired > 0 {
                    tracing::debug!("Discarded {} expired acknowledgements", expired);
                }
            }
        })
    }

    /// Disconnect every session from every namespace
    pub async fn shutdown(&self) {
        for namespace in self.inner.registry.namespaces().await {
            for (sid, connection) in self.inner.registry.sessions(&namespace).await {
                if let Err(e) = connection.send_packet(&SocketPacket::disconnect(&namespace)) {
                    tracing::debug!("Could not notify {} of shutdown: {}", sid, e);
                }
                self.disconnect_namespace(&sid, &namespace, DisconnectReason::ServerShutdown)
                    .await;
            }
        }
        tracing::info!("Socket.IO server shut down");
    }

    pub async fn stats(&self) -> ServerStats {
        let registry = self.inner.registry.stats().await;
        ServerStats {
            sessions: registry.sessions,
            clients: registry.clients,
            rooms: self.inner.rooms.room_count().await,
            namespaces: self.namespace_paths(),
            pending_acks: self.inner.acks.pending_count().await,
            metrics: self.inner.metrics.get_all_metrics().await,
        }
    }

    fn require_namespace(&self, namespace: &str) -> Result<(), SocketError> {
        if self.inner.namespaces.contains_key(namespace) {
            Ok(())
        } else {
            Err(SocketError::UnknownNamespace(namespace.to_string()))
        }
    }
}

fn unnamed(
    event: &str,
    namespace: &str,
    payload: impl Into<Payload>,
    target: Target,
    exclude: Option<&str>,
) -> Emission {
    let emission = Emission::new(event, payload)
        .namespace(namespace)
        .to(target);
    match exclude {
        Some(sid) => emission.exclude(sid),
        None => emission,
    }
}
