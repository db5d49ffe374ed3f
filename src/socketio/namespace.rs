/// Namespaces and their handler tables
///
/// A namespace is plain configuration data: a map from event name to handler
/// plus the optional lifecycle hooks. It is assembled before the server starts
/// and never changes afterwards, so dispatch reads it without locking.
use crate::error::SocketError;
use crate::socketio::connection::Sid;
use crate::socketio::socket::Socket;
use crate::socketio::Payload;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub const RESERVED_EVENTS: [&str; 4] = ["connect", "disconnect", "message", "json"];

pub type HandlerResult = anyhow::Result<Payload>;
pub type Handler = Arc<dyn Fn(Socket, Payload) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type ConnectHandler = Arc<
    dyn Fn(Socket, Option<JsonValue>) -> BoxFuture<'static, Result<(), ConnectionRefused>>
        + Send
        + Sync,
>;
pub type DisconnectHandler =
    Arc<dyn Fn(Socket, DisconnectReason) -> BoxFuture<'static, ()> + Send + Sync>;
/// Must not fail; an `Err` is logged and dropped
pub type ErrorHandler = Arc<dyn Fn(&HandlerFailure) -> anyhow::Result<()> + Send + Sync>;

/// What an inbound event name refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Json,
    Named(String),
}

impl EventKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "connect" => EventKind::Connect,
            "disconnect" => EventKind::Disconnect,
            "message" => EventKind::Message,
            "json" => EventKind::Json,
            other => EventKind::Named(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Message => "message",
            EventKind::Json => "json",
            EventKind::Named(name) => name,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, EventKind::Named(_))
    }
}

/// Refusal returned by a `connect` hook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionRefused {
    reason: Option<String>,
}

impl ConnectionRefused {
    pub const DEFAULT_MESSAGE: &'static str = "Connection rejected by server";

    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    pub fn without_reason() -> Self {
        Self::default()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Text sent to the client in CONNECT_ERROR
    pub fn message(&self) -> &str {
        self.reason.as_deref().unwrap_or(Self::DEFAULT_MESSAGE)
    }
}

impl fmt::Display for ConnectionRefused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for ConnectionRefused {}

impl From<ConnectionRefused> for SocketError {
    fn from(refused: ConnectionRefused) -> Self {
        SocketError::ConnectionRefused(refused.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientNamespaceDisconnect,
    ServerNamespaceDisconnect,
    TransportClose,
    PingTimeout,
    ServerShutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::ClientNamespaceDisconnect => "client namespace disconnect",
            DisconnectReason::ServerNamespaceDisconnect => "server namespace disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ServerShutdown => "server shutting down",
        };
        f.write_str(text)
    }
}

/// A handler failure as seen by error hooks
#[derive(Debug)]
pub struct HandlerFailure {
    pub sid: Sid,
    pub namespace: String,
    pub event: String,
    pub error: anyhow::Error,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "handler '{}' in {} failed for {}: {:#}",
            self.event, self.namespace, self.sid, self.error
        )
    }
}

impl From<HandlerFailure> for SocketError {
    fn from(failure: HandlerFailure) -> Self {
        SocketError::Handler {
            namespace: failure.namespace,
            event: failure.event,
            source: failure.error,
        }
    }
}

pub(crate) fn event_handler<F, Fut, R>(f: F) -> Handler
where
    F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Payload> + 'static,
{
    Arc::new(move |socket, payload| {
        let fut = f(socket, payload);
        async move { fut.await.map(Into::into) }.boxed()
    })
}

#[derive(Clone)]
pub struct Namespace {
    path: String,
    handlers: HashMap<String, Handler>,
    on_message: Option<Handler>,
    on_json: Option<Handler>,
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_error: Option<ErrorHandler>,
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&String> = self.handlers.keys().collect();
        events.sort();
        f.debug_struct("Namespace")
            .field("path", &self.path)
            .field("events", &events)
            .field("on_message", &self.on_message.is_some())
            .field("on_json", &self.on_json.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl Namespace {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            handlers: HashMap::new(),
            on_message: None,
            on_json: None,
            on_connect: None,
            on_disconnect: None,
            on_error: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register a handler for a custom event. Reserved names and duplicate
    /// registrations are rejected here rather than at dispatch.
    pub fn on<F, Fut, R>(self, event: &str, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Payload> + 'static,
    {
        self.on_handler(event, event_handler(handler))
    }

    pub(crate) fn on_handler(mut self, event: &str, handler: Handler) -> Result<Self, SocketError> {
        if EventKind::parse(event).is_reserved() {
            return Err(SocketError::configuration(format!(
                "'{}' is a reserved event name and cannot be used for a custom handler in {}",
                event, self.path
            )));
        }
        if self.handlers.contains_key(event) {
            return Err(SocketError::configuration(format!(
                "Handler for '{}' registered twice in {}",
                event, self.path
            )));
        }
        self.handlers.insert(event.to_string(), handler);
        Ok(self)
    }

    /// Handler for unnamed text messages (`send`)
    pub fn on_message<F, Fut, R>(mut self, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Payload> + 'static,
    {
        Self::set_once(&mut self.on_message, event_handler(handler), "message", &self.path)?;
        Ok(self)
    }

    /// Handler for unnamed JSON messages (`send` with json)
    pub fn on_json<F, Fut, R>(mut self, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Into<Payload> + 'static,
    {
        Self::set_once(&mut self.on_json, event_handler(handler), "json", &self.path)?;
        Ok(self)
    }

    pub fn on_connect<F, Fut>(mut self, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, Option<JsonValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConnectionRefused>> + Send + 'static,
    {
        let handler: ConnectHandler = Arc::new(move |socket, auth| handler(socket, auth).boxed());
        Self::set_once(&mut self.on_connect, handler, "connect", &self.path)?;
        Ok(self)
    }

    pub fn on_disconnect<F, Fut>(mut self, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(Socket, DisconnectReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: DisconnectHandler =
            Arc::new(move |socket, reason| handler(socket, reason).boxed());
        Self::set_once(&mut self.on_disconnect, handler, "disconnect", &self.path)?;
        Ok(self)
    }

    pub fn on_error<F>(mut self, handler: F) -> Result<Self, SocketError>
    where
        F: Fn(&HandlerFailure) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        Self::set_once(&mut self.on_error, handler, "error", &self.path)?;
        Ok(self)
    }

    /// Resolve the handler for an inbound event, if any
    pub fn handler(&self, kind: &EventKind) -> Option<&Handler> {
        match kind {
            EventKind::Named(name) => self.handlers.get(name),
            EventKind::Message => self.on_message.as_ref(),
            EventKind::Json => self.on_json.as_ref(),
            // Lifecycle events are driven by CONNECT/DISCONNECT packets only
            EventKind::Connect | EventKind::Disconnect => None,
        }
    }

    pub fn connect_handler(&self) -> Option<&ConnectHandler> {
        self.on_connect.as_ref()
    }

    pub fn disconnect_handler(&self) -> Option<&DisconnectHandler> {
        self.on_disconnect.as_ref()
    }

    pub fn error_handler(&self) -> Option<&ErrorHandler> {
        self.on_error.as_ref()
    }

    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn set_once<T>(slot: &mut Option<T>, value: T, what: &str, path: &str) -> Result<(), SocketError> {
        if slot.is_some() {
            return Err(SocketError::configuration(format!(
                "'{}' handler registered twice in {}",
                what, path
            )));
        }
        *slot = Some(value);
        Ok(())
    }
}
