//! Error types for the wire core.

use mirror_types::error::MirrorError;
use thiserror::Error;

/// Errors from the transport and session layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
}

/// Errors surfaced to callers of routed objects.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A shared error (no connection, timeout, remote failure, ...).
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// Sending the request failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The handle was released before the call.
    #[error("Object handle for {0} was already released")]
    Released(String),

    /// The router was dropped while the call was in flight.
    #[error("Router shut down")]
    ShutDown,
}

impl RouterError {
    /// The underlying shared error, if any.
    pub fn as_mirror(&self) -> Option<&MirrorError> {
        match self {
            RouterError::Mirror(e) => Some(e),
            _ => None,
        }
    }
}

/// Alias for router results.
pub type RouterResult<T> = Result<T, RouterError>;
