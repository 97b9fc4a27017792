//! Client error types.

use crate::connection::SessionState;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] dps150_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    /// A newer request for the same type code replaced this one.
    #[error("request superseded by a newer request for type {0}")]
    Superseded(u8),

    #[error("invalid session state: {0:?}")]
    InvalidState(SessionState),

    #[error("a command queue is already running")]
    QueueBusy,

    #[error("unexpected response for type {0}")]
    UnexpectedResponse(u8),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout
                | ClientError::Superseded(_)
                | ClientError::ConnectionClosed
        )
    }
}
