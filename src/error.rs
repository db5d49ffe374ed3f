use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    #[error("Handler error in {namespace} for '{event}': {source}")]
    Handler {
        namespace: String,
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Connection refused: {}", .0.as_deref().unwrap_or("no reason given"))]
    ConnectionRefused(Option<String>),

    #[error("Delivery to session {0} failed: connection closed")]
    Delivery(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Acknowledgement callbacks require a single-session target")]
    AckRequiresSingleRecipient,
}

impl SocketError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SocketError::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        SocketError::Protocol(msg.into())
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ResponseError for SocketError {
    fn error_response(&self) -> HttpResponse {
        if self.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Request failed: {}", self);
        }

        HttpResponse::build(self.status_code()).json(ErrorResponse {
            detail: self.to_string(),
        })
    }

    fn status_code(&self) -> StatusCode {
        match self {
            SocketError::UnknownNamespace(_) => StatusCode::NOT_FOUND,
            SocketError::Configuration(_) => StatusCode::BAD_REQUEST,
            SocketError::AckRequiresSingleRecipient => StatusCode::BAD_REQUEST,
            SocketError::Protocol(_) => StatusCode::BAD_REQUEST,
            SocketError::Handler { .. }
            | SocketError::ConnectionRefused(_)
            | SocketError::Delivery(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
