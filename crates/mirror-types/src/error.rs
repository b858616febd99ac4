//! Shared error types for the mirror system.

use thiserror::Error;

/// Top-level error type for the mirror system.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// A message arrived on a session that has not authenticated yet.
    #[error("Authentication required")]
    AuthRequired,

    /// The submitted credential was rejected.
    #[error("Authentication failed")]
    AuthFailed,

    /// An inbound envelope could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A best-match call found no live peer to execute on.
    #[error("no connection available")]
    NoConnectionAvailable,

    /// No reply arrived for a call within the reply timeout.
    #[error("Timeout waiting for reply to callId {call_id}")]
    ReplyTimeout {
        /// The call that timed out.
        call_id: u64,
    },

    /// The remote peer executed the method and it failed.
    #[error("Remote method error: {0}")]
    RemoteMethod(String),

    /// No definition is registered for this object type.
    #[error("no definition for type \"{0}\"")]
    UnknownObjectType(String),

    /// The object does not implement the requested method.
    #[error("Unknown method '{method}' on object type '{object_type}'")]
    UnknownMethod {
        /// The object type the method was invoked on.
        object_type: String,
        /// The method name.
        method: String,
    },

    /// The parameters did not match what the method expects.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with MirrorError.
pub type MirrorResult<T> = Result<T, MirrorError>;
