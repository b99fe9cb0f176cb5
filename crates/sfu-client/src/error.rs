use sfu_protocol::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request {message_type} ({uuid}) timed out")]
    Timeout { message_type: String, uuid: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether this is a server-side error carrying `code`
    pub fn is_code(&self, code: ErrorCode) -> bool {
        matches!(self, ClientError::Remote { code: c, .. } if c == code.as_str())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
