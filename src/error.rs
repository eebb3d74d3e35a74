use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<GraphError> for AppError {
    fn from(err: GraphError) -> Self {
        let status = match err {
            GraphError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        AppError::new(status, format!("graph request failed: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    // Computed HMAC does not match the delivered signature.
    #[error("data signature mismatch")]
    Integrity,

    #[error("decryption failed: {0}")]
    Crypto(String),

    #[error("invalid encoding: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("token acquisition failed: {0}")]
    Auth(String),
}

impl From<reqwest::Error> for GraphError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GraphError::Timeout
        } else if err.is_decode() {
            GraphError::Decode(err.to_string())
        } else {
            GraphError::Transport(err.to_string())
        }
    }
}
