//! Error types for sockwire.

use std::io;

use thiserror::Error;

use crate::channel::CloseReason;

/// Main error type for all sockwire operations.
#[derive(Debug, Error)]
pub enum SockwireError {
    /// I/O error during socket/stream operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON error while loading options.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed frame, oversized package, bad handshake).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A protocol path that is deliberately not supported.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Channel is closed; sending is not allowed.
    #[error("Channel is closed")]
    ChannelClosed,

    /// The package stream or listener has already been started.
    #[error("Already running")]
    AlreadyRunning,

    /// Backpressure timeout - send queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid option value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SockwireError {
    /// Shorthand for building a [`SockwireError::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// The close reason a channel records when it stops because of this error.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Protocol(_) | Self::NotImplemented(_) => CloseReason::ProtocolError,
            Self::Io(_) => CloseReason::SocketError,
            _ => CloseReason::Unknown,
        }
    }
}

/// Returns true for I/O errors that only mean the peer is already gone.
pub fn is_ignorable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Result type alias using SockwireError.
pub type Result<T> = std::result::Result<T, SockwireError>;
