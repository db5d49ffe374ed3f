/// HTTP admin surface
///
/// Health/stats reporting and server-originated emits, next to the Socket.IO
/// WebSocket endpoint.
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ErrorResponse, SocketError};
use crate::socketio::protocol::DEFAULT_NAMESPACE;
use crate::socketio::{transport, Emission, Payload, Server, ServerStats, Target};

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(get_health))
        .route("/emit", web::post().to(post_emit))
        .route("/socket.io/", web::get().to(transport::socketio_handler))
        .route("/socket.io", web::get().to(transport::socketio_handler));
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub stats: ServerStats,
    pub timestamp: i64,
}

/// Get Socket.IO health status
pub async fn get_health(server: web::Data<Server>) -> Result<HttpResponse, SocketError> {
    Ok(HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        stats: server.stats().await,
        timestamp: chrono::Utc::now().timestamp(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub namespace: Option<String>,
    pub event: String,
    #[serde(default)]
    pub data: Option<JsonValue>,
    pub room: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmitResponse {
    pub status: String,
    pub sent: usize,
}

/// Emit an event from the server.
///
/// Addressed to `room` or `session_id` when given. Otherwise it goes to every
/// session in `namespace`, or to every session everywhere if no namespace is
/// named either.
pub async fn post_emit(
    server: web::Data<Server>,
    payload: web::Json<EmitRequest>,
) -> Result<HttpResponse, SocketError> {
    let request = payload.into_inner();

    let target = match (request.room, request.session_id) {
        (Some(_), Some(_)) => {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse {
                detail: "room and session_id are mutually exclusive".to_string(),
            }));
        }
        (Some(room), None) => Target::Room(room),
        (None, Some(sid)) => Target::Session(sid),
        (None, None) if request.namespace.is_some() => Target::NamespaceBroadcast,
        (None, None) => Target::Global,
    };

    let data = request.data.map(Payload::from).unwrap_or_default();
    let namespace = request
        .namespace
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    tracing::debug!("Server emit '{}' to {:?} in {}", request.event, target, namespace);

    let sent = server
        .emit(Emission::new(request.event, data).namespace(namespace).to(target))
        .await?;

    Ok(HttpResponse::Ok().json(EmitResponse {
        status: "ok".to_string(),
        sent,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::socketio::{Connection, Dispatcher, Outbound};
    use actix_web::{http::StatusCode, test, App};
    use serde_json::json;

    #[actix_web::test]
    async fn test_health_reports_stats() {
        let server = Server::builder(Config::default()).build();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(server.clone()))
                .app_data(web::Data::new(Dispatcher::new(server)))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: JsonValue = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["namespaces"], json!(["/"]));
        assert!(body["metrics"]["connections"].is_object());
    }

    #[actix_web::test]
    async fn test_emit_reaches_connected_session() {
        let server = Server::builder(Config::default()).build();
        let dispatcher = Dispatcher::new(server.clone());
        let (conn, mut rx) = Connection::new("a");
        dispatcher.dispatch(&conn, "0").await;
        let _ = rx.try_recv();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(server))
                .app_data(web::Data::new(dispatcher))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/emit")
            .set_json(json!({"event": "from server", "data": {"data": "hello from server"}}))
            .to_request();
        let body: EmitResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body.status, "ok");
        assert_eq!(body.sent, 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(r#"42["from server",{"data":"hello from server"}]"#.into())
        );
    }

    #[actix_web::test]
    async fn test_emit_error_statuses() {
        let server = Server::builder(Config::default()).build();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(server.clone()))
                .app_data(web::Data::new(Dispatcher::new(server)))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/emit")
            .set_json(json!({"namespace": "/nope", "event": "x", "room": "r"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/emit")
            .set_json(json!({"event": "x", "room": "r", "session_id": "s"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_polling_transport_rejected() {
        let server = Server::builder(Config::default()).build();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(server.clone()))
                .app_data(web::Data::new(Dispatcher::new(server)))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/socket.io/?EIO=4&transport=polling")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/socket.io/?EIO=3&transport=websocket")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
