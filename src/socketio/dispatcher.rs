/// Event Dispatcher
///
/// Each connection gets one worker task consuming a bounded inbound queue, so
/// events from one client are handled strictly in arrival order while a slow
/// handler only holds up its own connection.
///
/// Per frame: decode, resolve namespace, resolve handler, invoke, then reply
/// with an ACK if the client asked for one.
use crate::error::SocketError;
use crate::socketio::connection::Connection;
use crate::socketio::namespace::{DisconnectReason, EventKind, HandlerFailure};
use crate::socketio::protocol::{SocketPacket, SocketPacketType};
use crate::socketio::server::Server;
use crate::socketio::socket::Socket;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Work item handed from the transport to a connection's worker
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A Socket.IO packet, already unwrapped from its Engine.IO MESSAGE
    Frame(String),
    /// The transport is gone; no further frames follow
    Closed(DisconnectReason),
}

/// Inbound half of a connection, held by the transport
#[derive(Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<Inbound>,
}

impl DispatchHandle {
    /// Queue an item for the worker, waiting for capacity. Returns false once
    /// the worker has stopped.
    pub async fn submit(&self, item: Inbound) -> bool {
        self.sender.send(item).await.is_ok()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    server: Server,
}

impl Dispatcher {
    pub fn new(server: Server) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Start the worker for a new connection
    pub fn spawn(&self, connection: Connection) -> DispatchHandle {
        let capacity = self.server.config().inbound_queue_capacity.max(1);
        let (sender, mut receiver) = mpsc::channel(capacity);
        let dispatcher = self.clone();
        let span = tracing::info_span!("socket", sid = %connection.id());

        tokio::spawn(
            async move {
                let mut reason = DisconnectReason::TransportClose;
                while let Some(item) = receiver.recv().await {
                    match item {
                        Inbound::Frame(frame) => dispatcher.dispatch(&connection, &frame).await,
                        Inbound::Closed(closed) => {
                            reason = closed;
                            break;
                        }
                    }
                }

                let released = dispatcher.server.disconnect(connection.id(), reason).await;
                tracing::debug!("Worker stopped, released {} namespaces", released);
            }
            .instrument(span),
        );

        DispatchHandle { sender }
    }

    /// Handle one Socket.IO packet from `connection`
    pub async fn dispatch(&self, connection: &Connection, frame: &str) {
        let packet = match SocketPacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Dropping frame from {}: {}", connection.id(), e);
                return;
            }
        };

        match packet.packet_type {
            SocketPacketType::Connect => {
                self.server
                    .activate(connection, &packet.namespace, packet.data)
                    .await
            }
            SocketPacketType::Disconnect => {
                self.server
                    .disconnect_namespace(
                        connection.id(),
                        &packet.namespace,
                        DisconnectReason::ClientNamespaceDisconnect,
                    )
                    .await;
            }
            SocketPacketType::Event => self.handle_event(connection, packet).await,
            SocketPacketType::Ack => self.handle_ack(connection, packet).await,
            SocketPacketType::ConnectError => {
                tracing::warn!("Ignoring CONNECT_ERROR sent by client {}", connection.id());
            }
            SocketPacketType::BinaryEvent | SocketPacketType::BinaryAck => {
                tracing::warn!(
                    "Binary packets are not supported, dropping frame from {}",
                    connection.id()
                );
            }
        }
    }

    async fn handle_event(&self, connection: &Connection, packet: SocketPacket) {
        let sid = connection.id();
        let namespace = packet.namespace.as_str();

        let Some(ns) = self.server.namespace(namespace) else {
            tracing::warn!("{}", SocketError::UnknownNamespace(namespace.to_string()));
            return;
        };

        if !self.server.is_established(sid, namespace).await {
            tracing::warn!("Session {} sent an event to inactive namespace {}", sid, namespace);
            return;
        }

        let Some((event, payload)) = packet.event_parts() else {
            tracing::warn!("Malformed EVENT from {} in {}", sid, namespace);
            return;
        };

        let kind = EventKind::parse(&event);
        let Some(handler) = ns.handler(&kind) else {
            self.server.metrics().record_event_unhandled().await;
            if !kind.is_reserved() {
                tracing::debug!("No handler for '{}' in {}", event, namespace);
            }
            return;
        };

        // Keyed by name only once a handler exists, so clients cannot grow the map
        self.server.metrics().record_event_received(&event).await;

        let socket = Socket::new(sid, namespace, self.server.clone());
        let result = match AssertUnwindSafe(handler(socket, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(&*panic)
            )),
        };

        match result {
            Ok(reply) => {
                if let Some(id) = packet.id {
                    let ack = SocketPacket::ack(namespace, id, &reply);
                    if let Err(e) = connection.send_packet(&ack) {
                        tracing::debug!("Could not deliver ack {} for '{}': {}", id, event, e);
                    }
                }
            }
            Err(error) => {
                self.server
                    .report_failure(HandlerFailure {
                        sid: sid.to_string(),
                        namespace: namespace.to_string(),
                        event,
                        error,
                    })
                    .await
            }
        }
    }

    async fn handle_ack(&self, connection: &Connection, packet: SocketPacket) {
        let Some(id) = packet.id else {
            tracing::warn!("ACK without id from {}", connection.id());
            return;
        };
        self.server
            .acks()
            .process_ack(connection.id(), &packet.namespace, id, packet.ack_payload())
            .await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::socketio::connection::Outbound;
    use crate::socketio::fanout::{Emission, Target};
    use crate::socketio::metrics::UNHANDLED_EVENT;
    use crate::socketio::Payload;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    async fn connect(
        dispatcher: &Dispatcher,
        sid: &str,
    ) -> (Connection, UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = Connection::new(sid);
        dispatcher.dispatch(&conn, "0").await;
        drain(&mut rx);
        (conn, rx)
    }

    fn chat_server() -> Dispatcher {
        let server = Server::builder(Config::default())
            .on("/", "join", |socket: Socket, payload: Payload| async move {
                let room: String = payload.arg(0)?;
                socket.join(&room).await?;
                anyhow::Ok(())
            })
            .unwrap()
            .on("/", "chat", |socket: Socket, payload: Payload| async move {
                socket
                    .to("lobby")
                    .except_self()
                    .emit("chat", payload)
                    .await?;
                anyhow::Ok(())
            })
            .unwrap()
            .on("/", "echo", |_, _| async { anyhow::Ok(json!("pong")) })
            .unwrap()
            .on("/", "noop", |_, _| async { anyhow::Ok(()) })
            .unwrap()
            .build();
        Dispatcher::new(server)
    }

    #[tokio::test]
    async fn test_room_chat_excludes_sender() {
        let dispatcher = chat_server();
        let (a, mut a_rx) = connect(&dispatcher, "a").await;
        let (b, mut b_rx) = connect(&dispatcher, "b").await;

        dispatcher.dispatch(&a, r#"2["join","lobby"]"#).await;
        dispatcher.dispatch(&b, r#"2["join","lobby"]"#).await;
        dispatcher.dispatch(&a, r#"2["chat",{"text":"hi"}]"#).await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec![r#"42["chat",{"text":"hi"}]"#]);
    }

    #[tokio::test]
    async fn test_handler_return_value_is_acknowledged() {
        let dispatcher = chat_server();
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, r#"21["echo"]"#).await;
        dispatcher.dispatch(&a, r#"25["noop"]"#).await;
        // No ack requested, no reply
        dispatcher.dispatch(&a, r#"2["echo"]"#).await;

        assert_eq!(drain(&mut rx), vec![r#"431["pong"]"#, "435[]"]);
    }

    #[tokio::test]
    async fn test_failures_reach_error_hook_and_connection_survives() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();

        let server = Server::builder(Config::default())
            .on("/", "fail", |_, _| async {
                Err::<(), _>(anyhow::anyhow!("nope"))
            })
            .unwrap()
            .on("/", "explode", |_, _| async {
                if true {
                    panic!("kaboom");
                }
                anyhow::Ok(())
            })
            .unwrap()
            .on("/", "echo", |_, _| async { anyhow::Ok(json!("pong")) })
            .unwrap()
            .on_error("/", move |failure| {
                sink.lock()
                    .unwrap()
                    .push(format!("{}: {}", failure.event, failure.error));
                Ok(())
            })
            .unwrap()
            .build();
        let dispatcher = Dispatcher::new(server);
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, r#"21["fail"]"#).await;
        dispatcher.dispatch(&a, r#"2["explode"]"#).await;
        dispatcher.dispatch(&a, r#"22["echo"]"#).await;

        assert_eq!(
            *failures.lock().unwrap(),
            vec!["fail: nope", "explode: handler panicked: kaboom"]
        );
        // The failed event gets no ack; later events are still served
        assert_eq!(drain(&mut rx), vec![r#"432["pong"]"#]);
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_namespaces_are_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let server = Server::builder(Config::default())
            .on("/chat", "chat", move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap()
            .build();
        let dispatcher = Dispatcher::new(server);
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, r#"2/chat,["chat"]"#).await;
        dispatcher.dispatch(&a, r#"2/nope,["chat"]"#).await;
        dispatcher.dispatch(&a, r#"2not json"#).await;
        dispatcher.dispatch(&a, r#"2["unhandled"]"#).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());

        dispatcher.dispatch(&a, "0/chat,").await;
        dispatcher.dispatch(&a, r#"2/chat,["chat"]"#).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx), vec![r#"40/chat,{"sid":"a"}"#]);
    }

    #[tokio::test]
    async fn test_unhandled_event_names_do_not_grow_metrics() {
        let dispatcher = Dispatcher::new(Server::builder(Config::default()).build());
        let (a, _rx) = connect(&dispatcher, "a").await;

        for n in 0..500 {
            dispatcher
                .dispatch(&a, &format!(r#"2["junk-{}"]"#, n))
                .await;
        }

        let events = dispatcher.server().metrics().get_event_metrics().await;
        assert_eq!(events.received.len(), 1);
        assert_eq!(events.received.get(UNHANDLED_EVENT), Some(&500));
    }

    #[tokio::test]
    async fn test_unnamed_message_without_handler_is_silent() {
        let dispatcher = chat_server();
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, r#"21["message","hello"]"#).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_client_ack_completes_server_emit_once() {
        let dispatcher = chat_server();
        let (a, mut rx) = connect(&dispatcher, "a").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher
            .server()
            .emit(
                Emission::new("question", json!(1))
                    .to(Target::Session("a".into()))
                    .with_ack(move |reply| sink.lock().unwrap().push(reply)),
            )
            .await
            .unwrap();

        let frame = drain(&mut rx).remove(0);
        let id: String = frame
            .strip_prefix("42")
            .unwrap()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();

        dispatcher.dispatch(&a, &format!(r#"3{}["ok"]"#, id)).await;
        dispatcher.dispatch(&a, &format!(r#"3{}["again"]"#, id)).await;

        assert_eq!(*seen.lock().unwrap(), vec![Payload::from(json!("ok"))]);
    }

    #[tokio::test]
    async fn test_client_namespace_disconnect() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();

        let server = Server::builder(Config::default())
            .on_disconnect("/chat", move |_, reason| {
                let counter = counter.clone();
                async move {
                    assert_eq!(reason, DisconnectReason::ClientNamespaceDisconnect);
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
            .build();
        let dispatcher = Dispatcher::new(server);
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, "0/chat,").await;
        dispatcher.dispatch(&a, "1/chat,").await;
        dispatcher.dispatch(&a, "1/chat,").await;

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(dispatcher.server().is_established("a", "/").await);
        assert_eq!(drain(&mut rx), vec![r#"40/chat,{"sid":"a"}"#]);
    }

    async fn next_frame(rx: &mut UnboundedReceiver<Outbound>, wait: Duration) -> Option<Outbound> {
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_stall_other_connections() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = gate.clone();

        let server = Server::builder(Config::default())
            .on("/", "slow", move |_, _| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    anyhow::Ok(json!("done"))
                }
            })
            .unwrap()
            .on("/", "echo", |_, _| async { anyhow::Ok(json!("pong")) })
            .unwrap()
            .build();
        let dispatcher = Dispatcher::new(server);

        let (a, mut a_rx) = Connection::new("a");
        let (b, mut b_rx) = Connection::new("b");
        let a_handle = dispatcher.spawn(a);
        let b_handle = dispatcher.spawn(b);

        for handle in [&a_handle, &b_handle] {
            assert!(handle.submit(Inbound::Frame("0".into())).await);
        }
        assert!(a_handle.submit(Inbound::Frame(r#"21["slow"]"#.into())).await);
        assert!(b_handle.submit(Inbound::Frame(r#"21["echo"]"#.into())).await);

        let wait = Duration::from_secs(1);
        assert_eq!(
            next_frame(&mut b_rx, wait).await,
            Some(Outbound::Frame(r#"40{"sid":"b"}"#.into()))
        );
        assert_eq!(
            next_frame(&mut b_rx, wait).await,
            Some(Outbound::Frame(r#"431["pong"]"#.into()))
        );

        // a is still parked in its handler
        assert_eq!(
            next_frame(&mut a_rx, wait).await,
            Some(Outbound::Frame(r#"40{"sid":"a"}"#.into()))
        );
        assert_eq!(next_frame(&mut a_rx, Duration::from_millis(50)).await, None);

        release.notify_one();
        assert_eq!(
            next_frame(&mut a_rx, wait).await,
            Some(Outbound::Frame(r#"431["done"]"#.into()))
        );
    }

    #[tokio::test]
    async fn test_worker_finishes_connect_before_close() {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let on_connect = connects.clone();
        let on_disconnect = disconnects.clone();

        let server = Server::builder(Config::default())
            .on_connect("/", move |_, _| {
                let on_connect = on_connect.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    on_connect.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap()
            .on_disconnect("/", move |_, _| {
                let on_disconnect = on_disconnect.clone();
                async move {
                    on_disconnect.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
            .build();
        let dispatcher = Dispatcher::new(server);

        let (conn, mut rx) = Connection::new("a");
        let handle = dispatcher.spawn(conn);
        assert!(handle.submit(Inbound::Frame("0".into())).await);
        assert!(
            handle
                .submit(Inbound::Closed(DisconnectReason::TransportClose))
                .await
        );

        let mut received = Vec::new();
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            let done = item == Outbound::Close;
            received.push(item);
            if done {
                break;
            }
        }

        assert_eq!(
            received,
            vec![
                Outbound::Frame(r#"40{"sid":"a"}"#.into()),
                Outbound::Close
            ]
        );
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
