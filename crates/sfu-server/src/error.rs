use crate::engine::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use sfu_protocol::{ErrorBody, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Data producer not found: {0}")]
    DataProducerNotFound(String),

    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CannotConsume(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl SignalError {
    /// Stable wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            SignalError::SessionExists(_) => ErrorCode::SessionExists,
            SignalError::TransportNotFound(_) => ErrorCode::TransportNotFound,
            SignalError::ProducerNotFound(_) => ErrorCode::ProducerNotFound,
            SignalError::DataProducerNotFound(_) => ErrorCode::DataProducerNotFound,
            SignalError::CannotConsume(_) => ErrorCode::CannotConsume,
            SignalError::BadRequest(_) => ErrorCode::BadRequest,
            SignalError::Engine(EngineError::NotFound { kind, .. }) => match *kind {
                "producer" => ErrorCode::ProducerNotFound,
                "dataProducer" => ErrorCode::DataProducerNotFound,
                "transport" => ErrorCode::TransportNotFound,
                _ => ErrorCode::EngineError,
            },
            SignalError::Engine(EngineError::InvalidParameters(_)) => ErrorCode::BadRequest,
            SignalError::Engine(_) => ErrorCode::EngineError,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let status = match self.code() {
            ErrorCode::SessionNotFound
            | ErrorCode::TransportNotFound
            | ErrorCode::ProducerNotFound
            | ErrorCode::DataProducerNotFound => StatusCode::NOT_FOUND,
            ErrorCode::SessionExists => StatusCode::CONFLICT,
            ErrorCode::BadRequest | ErrorCode::CannotConsume => StatusCode::BAD_REQUEST,
            ErrorCode::EngineError => {
                tracing::error!("Engine error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_body()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;
