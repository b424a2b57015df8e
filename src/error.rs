use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::model::{ModelError, RejectedOp};

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or unparseable frame. The offending connection is closed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation rejected: {0}")]
    Rejected(#[from] RejectedOp),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No usable state for the room; the caller may retry later.
    #[error("Room unavailable: {0}")]
    RoomUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Document model error: {0}")]
    Model(#[from] ModelError),

    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("Ticket error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Protocol(_) | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::Rejected(_) => StatusCode::CONFLICT,
            AppError::InvalidTicket(_) | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RoomUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_)
            | AppError::Internal(_)
            | AppError::Model(_)
            | AppError::Codec(_)
            | AppError::Database(_)
            | AppError::Env(_)
            | AppError::Io(_)
            | AppError::AddrParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code carried by websocket `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Protocol(_) => "protocol",
            AppError::Rejected(_) => "rejected",
            AppError::Store(_) | AppError::Database(_) => "store",
            AppError::InvalidTicket(_) | AppError::Jwt(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::RoomUnavailable(_) => "room_unavailable",
            AppError::Internal(_)
            | AppError::Model(_)
            | AppError::Codec(_)
            | AppError::Env(_)
            | AppError::Io(_)
            | AppError::AddrParse(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}
