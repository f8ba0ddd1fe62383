//! Daemon error taxonomy, mapped onto the wire error codes.

use thiserror::Error;
use wormhole_shared::protocol::{ErrorCode, ServerMessage};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{0}")]
    SessionExists(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("{0}")]
    Driver(String),

    #[error("{0}")]
    InvalidMessage(String),

    #[error("Not subscribed to session: {0}")]
    NotSubscribed(String),
}

impl DaemonError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DaemonError::SessionExists(_) => ErrorCode::SessionExists,
            DaemonError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            DaemonError::Driver(_) => ErrorCode::DriverError,
            DaemonError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            DaemonError::NotSubscribed(_) => ErrorCode::NotSubscribed,
        }
    }

    /// Render as an `error` frame, optionally naming the session concerned.
    pub fn to_frame(&self, session: Option<&str>) -> ServerMessage {
        ServerMessage::Error {
            code: self.code(),
            message: self.to_string(),
            session: session.map(str::to_string),
        }
    }
}
