//! Error taxonomy for the fan-out core.
//!
//! - [`FanoutError`]: registry and engine errors returned to callers
//! - [`SendFailure`]: one connection could not take a frame; always recovered
//!   locally by the broadcast engine
//! - [`HandshakeFailure`]: an upgrade the server refused; surfaced as an HTTP
//!   status, never reaches the registry

use thiserror::Error;

use crate::ids::ConnectionId;

/// Errors raised by the registry and the broadcast engine.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// An id was registered twice. Indicates a bug in id assignment.
    #[error("connection {0} is already registered")]
    DuplicateIdentifier(ConnectionId),

    /// The registry has been shut down (or was never opened).
    #[error("connection registry is unavailable")]
    RegistryUnavailable,

    /// An event could not be encoded.
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for registry and engine operations.
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Why a frame could not be handed to one connection.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// The connection's writer is gone (peer closed or close in progress).
    #[error("connection closed")]
    Closed,

    /// The connection did not accept the frame within the send timeout.
    #[error("send timed out after {timeout_ms}ms")]
    Timeout {
        /// The bound that was exceeded.
        timeout_ms: u64,
    },
}

/// Reasons the server refuses a WebSocket upgrade.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    /// Shutdown has started; no new subscribers are admitted.
    #[error("server is shutting down")]
    ShuttingDown,

    /// The configured connection limit has been reached.
    #[error("connection limit of {max} reached")]
    CapacityReached {
        /// The configured limit.
        max: usize,
    },
}

impl HandshakeFailure {
    /// HTTP status code the upgrade is rejected with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ShuttingDown | Self::CapacityReached { .. } => 503,
        }
    }
}
