/// WebSocket transport
///
/// Speaks Engine.IO v4 over actix-ws. The reader loop unwraps MESSAGE packets
/// and hands them to the connection's dispatch worker; the writer loop drains
/// the connection's outbound queue onto the socket. Long-polling is not
/// offered, so the handshake only accepts `transport=websocket`.
use crate::config::Config;
use crate::socketio::connection::{Connection, Outbound};
use crate::socketio::dispatcher::{DispatchHandle, Dispatcher, Inbound};
use crate::socketio::namespace::DisconnectReason;
use crate::socketio::protocol::{EnginePacket, EnginePacketType};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_ws::{Message as WsMessage, ProtocolError};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "EIO")]
    pub eio: Option<String>,
    pub transport: Option<String>,
}

/// `GET /socket.io/?EIO=4&transport=websocket`
pub async fn socketio_handler(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<HandshakeQuery>,
    dispatcher: web::Data<Dispatcher>,
) -> Result<HttpResponse, Error> {
    if query.transport.as_deref() != Some("websocket") {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "code": 0,
            "message": "Transport unknown"
        })));
    }
    if query.eio.as_deref() != Some("4") {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "code": 5,
            "message": "Unsupported protocol version"
        })));
    }

    let (response, session, messages) = actix_ws::handle(&req, stream)?;

    let config = dispatcher.server().config().clone();
    let (connection, outbound) = open_connection(&config, uuid::Uuid::new_v4().to_string());

    tracing::info!("WebSocket transport opened: {}", connection.id());

    let handle = dispatcher.spawn(connection.clone());

    actix_web::rt::spawn(write_loop(session, outbound));
    actix_web::rt::spawn(read_loop(
        messages.max_frame_size(config.max_payload),
        connection,
        handle,
        Heartbeat::from_config(&config),
    ));

    Ok(response)
}

/// Create the connection for a new transport and queue its OPEN handshake
fn open_connection(config: &Config, sid: String) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
    let (connection, outbound) = Connection::new(sid);

    let open = EnginePacket::open(
        connection.id(),
        config.ping_interval_ms,
        config.ping_timeout_ms,
        config.max_payload,
    );
    if let Err(e) = connection.send_engine(&open) {
        tracing::warn!("Could not queue OPEN for {}: {}", connection.id(), e);
    }

    (connection, outbound)
}

struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    max_payload: usize,
}

impl Heartbeat {
    fn from_config(config: &Config) -> Self {
        Self {
            interval: config.ping_interval(),
            timeout: config.ping_timeout(),
            max_payload: config.max_payload,
        }
    }
}

async fn write_loop(mut session: actix_ws::Session, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = session.text(frame).await {
                    tracing::debug!("WebSocket write failed: {:?}", e);
                    return;
                }
            }
            Outbound::Pong(payload) => {
                if let Err(e) = session.pong(&payload).await {
                    tracing::debug!("WebSocket pong failed: {:?}", e);
                    return;
                }
            }
            Outbound::Close => {
                let _ = session.close(None).await;
                return;
            }
        }
    }
}

async fn read_loop<S>(
    messages: S,
    connection: Connection,
    handle: DispatchHandle,
    heartbeat: Heartbeat,
) where
    S: Stream<Item = Result<WsMessage, ProtocolError>> + Unpin,
{
    let reason = receive(messages, &connection, &handle, &heartbeat).await;

    handle.submit(Inbound::Closed(reason)).await;
    connection.close();
    tracing::info!("WebSocket transport closed: {} ({})", connection.id(), reason);
}

/// Run the inbound side until the transport goes away, returning why
async fn receive<S>(
    mut messages: S,
    connection: &Connection,
    handle: &DispatchHandle,
    heartbeat: &Heartbeat,
) -> DisconnectReason
where
    S: Stream<Item = Result<WsMessage, ProtocolError>> + Unpin,
{
    let mut ticker = tokio::time::interval(heartbeat.interval);
    // The first tick completes immediately
    ticker.tick().await;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline.unwrap_or_else(|| Instant::now() + heartbeat.timeout);

        tokio::select! {
            msg = messages.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if text.len() > heartbeat.max_payload {
                        tracing::warn!("Frame of {} bytes exceeds max payload", text.len());
                        return DisconnectReason::TransportClose;
                    }

                    let packet = match EnginePacket::decode(&text) {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::warn!("Dropping frame from {}: {}", connection.id(), e);
                            continue;
                        }
                    };

                    match packet.packet_type {
                        EnginePacketType::Message => {
                            if !handle.submit(Inbound::Frame(packet.data)).await {
                                return DisconnectReason::TransportClose;
                            }
                        }
                        EnginePacketType::Pong => pong_deadline = None,
                        EnginePacketType::Ping => {
                            if connection.send_engine(&EnginePacket::pong(packet.data)).is_err() {
                                return DisconnectReason::TransportClose;
                            }
                        }
                        EnginePacketType::Close => return DisconnectReason::TransportClose,
                        EnginePacketType::Open
                        | EnginePacketType::Upgrade
                        | EnginePacketType::Noop => {}
                    }
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    if connection.send_ws_pong(payload).is_err() {
                        return DisconnectReason::TransportClose;
                    }
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    tracing::warn!("Binary frames are not supported, ignoring");
                }
                Some(Ok(WsMessage::Close(reason))) => {
                    tracing::info!("WebSocket close: {:?}", reason);
                    return DisconnectReason::TransportClose;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("WebSocket protocol error: {}", e);
                    return DisconnectReason::TransportClose;
                }
                None => return DisconnectReason::TransportClose,
            },

            _ = ticker.tick() => {
                if pong_deadline.is_none() {
                    if connection.send_engine(&EnginePacket::ping()).is_err() {
                        return DisconnectReason::TransportClose;
                    }
                    pong_deadline = Some(Instant::now() + heartbeat.timeout);
                }
            }

            _ = tokio::time::sleep_until(deadline), if pong_deadline.is_some() => {
                tracing::warn!("No pong from {} within {:?}", connection.id(), heartbeat.timeout);
                return DisconnectReason::PingTimeout;
            }
        }
    }
}
