/// Demonstration namespaces
///
/// `/` is registered handler by handler, `/test` as one whole `Namespace`, and
/// `/chat` carries its own error hook. Everything else falls back to the
/// default error handler.
use crate::config::Config;
use crate::error::SocketError;
use crate::socketio::{
    ConnectionRefused, DisconnectReason, HandlerFailure, Namespace, Payload, Server, Socket,
};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

pub const REFUSAL_MESSAGE: &str = "You Shall Not Pass!!!!!!";

#[derive(Debug, Deserialize)]
struct RoomRequest {
    username: String,
    room: String,
}

pub fn build_server(config: Config) -> Result<Server, SocketError> {
    let refused_token = config.refused_token.clone();

    let server = Server::builder(config)
        .on_message("/", handle_message)?
        .on_json("/", handle_json)?
        .on("/", "my event", my_event)?
        .on("/", "my custom event", my_custom_event)?
        .on("/", "my callback event", my_callback_event)?
        .on("/", "my broadcast event", my_broadcast_event)?
        .on("/", "join", on_join)?
        .on("/", "leave", on_leave)?
        .on_connect("/", move |socket, auth| {
            on_connect(socket, auth, refused_token.clone())
        })?
        .on_disconnect("/", on_disconnect)?
        .on_error("/", log_failure)?
        .namespace(test_namespace()?)?
        .on("/chat", "chat", chat)?
        .on_error("/chat", log_chat_failure)?
        .on_default_error(log_default_failure)?
        .build();

    Ok(server)
}

fn first_arg(payload: &Payload) -> JsonValue {
    payload.first().cloned().unwrap_or(JsonValue::Null)
}

async fn handle_message(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    let text: String = payload.arg(0)?;
    tracing::info!("Received message: {}", text);
    socket.send(text).await?;
    Ok(())
}

async fn handle_json(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    let value = first_arg(&payload);
    tracing::info!("Received json: {}", value);
    socket.send_json(value).await?;
    Ok(())
}

async fn my_event(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    tracing::debug!("Received my event in {}: {:?}", socket.namespace(), payload.args());
    socket.emit("my response", payload).await?;
    Ok(())
}

async fn my_custom_event(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    if payload.len() != 3 {
        anyhow::bail!("my custom event takes 3 arguments, got {}", payload.len());
    }
    tracing::info!("Received args: {:?}", payload.args());
    socket.emit("my response", payload).await?;
    Ok(())
}

async fn my_callback_event(socket: Socket, payload: Payload) -> anyhow::Result<&'static str> {
    let data = first_arg(&payload);
    socket
        .emit_with_ack("my response", data, |reply| {
            tracing::info!("Client acknowledged my response: {:?}", reply.args());
        })
        .await?;
    Ok("recieved")
}

async fn my_broadcast_event(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    socket.broadcast().emit("my response", payload).await?;
    Ok(())
}

async fn on_join(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    let request: RoomRequest = payload.arg(0)?;
    socket.join(&request.room).await?;
    socket
        .to(request.room.clone())
        .send(format!("{} joined the chat", request.username))
        .await?;
    Ok(())
}

async fn on_leave(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    let request: RoomRequest = payload.arg(0)?;
    socket.leave(&request.room).await?;
    socket
        .to(request.room.clone())
        .send(format!("{} left the chat", request.username))
        .await?;
    Ok(())
}

async fn on_connect(
    socket: Socket,
    auth: Option<JsonValue>,
    refused_token: Option<String>,
) -> Result<(), ConnectionRefused> {
    let token = auth
        .as_ref()
        .and_then(|auth| auth.get("token"))
        .and_then(JsonValue::as_str);

    if refused_token.is_some() && token == refused_token.as_deref() {
        tracing::warn!("Refusing {}: presented the refused token", socket.id());
        return Err(ConnectionRefused::new(REFUSAL_MESSAGE));
    }

    if let Err(e) = socket
        .emit("my response", json!({"data": "connected"}))
        .await
    {
        tracing::warn!("Could not greet {}: {}", socket.id(), e);
    }
    Ok(())
}

async fn on_disconnect(socket: Socket, reason: DisconnectReason) {
    tracing::info!("Client {} disconnected: {}", socket.id(), reason);
}

fn test_namespace() -> Result<Namespace, SocketError> {
    Namespace::new("/test")
        .on("namespace event", namespace_event)?
        .on("my function event", my_function_event)?
        .on("my event", my_event)?
        .on_connect(|socket: Socket, _auth| async move {
            tracing::debug!("Client {} joined /test", socket.id());
            Ok(())
        })?
        .on_disconnect(|socket: Socket, reason| async move {
            tracing::debug!("Client {} left /test: {}", socket.id(), reason);
        })
}

async fn namespace_event(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    tracing::info!("Received namespace event: {}", first_arg(&payload));
    socket.emit("my response", payload).await?;
    Ok(())
}

async fn my_function_event(_socket: Socket, _payload: Payload) -> anyhow::Result<()> {
    Ok(())
}

/// Forward a chat message to its room, skipping the sender
async fn chat(socket: Socket, payload: Payload) -> anyhow::Result<()> {
    let message = first_arg(&payload);
    let room = message
        .get("room")
        .and_then(JsonValue::as_str)
        .context("chat message has no room")?
        .to_string();

    socket.to(room).except_self().emit("chat", message).await?;
    Ok(())
}

fn log_failure(failure: &HandlerFailure) -> anyhow::Result<()> {
    tracing::error!("Error in default namespace: {}", failure);
    Ok(())
}

fn log_chat_failure(failure: &HandlerFailure) -> anyhow::Result<()> {
    tracing::error!("Error in /chat: {}", failure);
    Ok(())
}

fn log_default_failure(failure: &HandlerFailure) -> anyhow::Result<()> {
    tracing::error!("Unhandled socket error: {}", failure);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socketio::{Connection, Dispatcher, Outbound};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    fn demo(config: Config) -> Dispatcher {
        Dispatcher::new(build_server(config).unwrap())
    }

    async fn connect(dispatcher: &Dispatcher, sid: &str) -> (Connection, UnboundedReceiver<Outbound>) {
        let (conn, mut rx) = Connection::new(sid);
        dispatcher.dispatch(&conn, "0").await;
        drain(&mut rx);
        (conn, rx)
    }

    #[tokio::test]
    async fn test_connect_greets_client() {
        let dispatcher = demo(Config::default());
        let (conn, mut rx) = Connection::new("a");

        dispatcher.dispatch(&conn, "0").await;

        assert_eq!(
            drain(&mut rx),
            vec![
                r#"40{"sid":"a"}"#.to_string(),
                r#"42["my response",{"data":"connected"}]"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_refused_token() {
        let config = Config {
            refused_token: Some("letmein".to_string()),
            ..Config::default()
        };
        let dispatcher = demo(config);
        let (conn, mut rx) = Connection::new("a");

        dispatcher.dispatch(&conn, r#"0{"token":"letmein"}"#).await;
        assert_eq!(
            drain(&mut rx),
            vec![r#"44{"message":"You Shall Not Pass!!!!!!"}"#.to_string()]
        );

        dispatcher.dispatch(&conn, r#"0{"token":"other"}"#).await;
        assert_eq!(drain(&mut rx)[0], r#"40{"sid":"a"}"#);
    }

    #[tokio::test]
    async fn test_callback_event_acks_and_requests_ack() {
        let dispatcher = demo(Config::default());
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher
            .dispatch(&a, r#"27["my callback event",{"data":1}]"#)
            .await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("42"), "{}", frames[0]);
        assert!(frames[0].ends_with(r#"["my response",{"data":1}]"#), "{}", frames[0]);
        assert_eq!(frames[1], r#"437["recieved"]"#);
        assert_eq!(dispatcher.server().stats().await.pending_acks, 1);
    }

    #[tokio::test]
    async fn test_join_announces_to_room() {
        let dispatcher = demo(Config::default());
        let (a, mut a_rx) = connect(&dispatcher, "a").await;
        let (b, mut b_rx) = connect(&dispatcher, "b").await;

        dispatcher
            .dispatch(&a, r#"2["join",{"username":"ann","room":"r"}]"#)
            .await;
        dispatcher
            .dispatch(&b, r#"2["join",{"username":"bob","room":"r"}]"#)
            .await;

        assert_eq!(
            drain(&mut a_rx),
            vec![
                r#"42["message","ann joined the chat"]"#.to_string(),
                r#"42["message","bob joined the chat"]"#.to_string(),
            ]
        );
        assert_eq!(drain(&mut b_rx), vec![r#"42["message","bob joined the chat"]"#]);

        dispatcher
            .dispatch(&b, r#"2["leave",{"username":"bob","room":"r"}]"#)
            .await;
        assert_eq!(drain(&mut a_rx), vec![r#"42["message","bob left the chat"]"#]);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_class_style_namespace() {
        let dispatcher = demo(Config::default());
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, "0/test,").await;
        dispatcher.dispatch(&a, r#"2/test,["my event",{"x":1}]"#).await;
        dispatcher.dispatch(&a, r#"2/test,["my function event"]"#).await;

        assert_eq!(
            drain(&mut rx),
            vec![
                r#"40/test,{"sid":"a"}"#.to_string(),
                r#"42/test,["my response",{"x":1}]"#.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_skips_sender() {
        let dispatcher = demo(Config::default());
        let (a, mut a_rx) = connect(&dispatcher, "a").await;
        let (b, mut b_rx) = connect(&dispatcher, "b").await;

        for conn in [&a, &b] {
            dispatcher.dispatch(conn, "0/chat,").await;
            dispatcher
                .server()
                .join_room("/chat", conn.id(), "lobby")
                .await
                .unwrap();
        }
        drain(&mut a_rx);
        drain(&mut b_rx);

        dispatcher
            .dispatch(&a, r#"2/chat,["chat",{"room":"lobby","text":"hi"}]"#)
            .await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            drain(&mut b_rx),
            vec![r#"42/chat,["chat",{"room":"lobby","text":"hi"}]"#]
        );
    }

    #[tokio::test]
    async fn test_bad_arguments_do_not_break_connection() {
        let dispatcher = demo(Config::default());
        let (a, mut rx) = connect(&dispatcher, "a").await;

        dispatcher.dispatch(&a, r#"2["my custom event","x"]"#).await;
        dispatcher.dispatch(&a, r#"2["my custom event","x","y","z"]"#).await;

        assert_eq!(
            drain(&mut rx),
            vec![r#"42["my response","x","y","z"]"#]
        );
        assert_eq!(
            dispatcher
                .server()
                .metrics()
                .get_event_metrics()
                .await
                .failed
                .get("my custom event"),
            Some(&1)
        );
    }
}
