/// Error types for peer link operations
///
/// Only caller-visible failures live here. Peer timeouts and association
/// drops are internal state transitions: they are logged and reported through
/// the link-state hook, never returned.
use std::io;

use thiserror::Error;

/// Result type alias for peer link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Peer link error enumeration
#[derive(Debug, Error)]
pub enum LinkError {
    /// Command attempted while no peer is known; wait for discovery
    #[error("no peer known")]
    NoPeer,

    /// Transport-level send failure
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Acknowledgment not observed within the wait window
    #[error("no acknowledgment within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Another command is already waiting for its acknowledgment
    #[error("a command is already awaiting acknowledgment")]
    Busy,

    /// A network association attempt could not be issued
    #[error("association attempt failed: {0}")]
    AssociationFailed(String),

    /// Framed datagram would exceed the maximum payload size
    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload cannot be carried on a single wire line
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Socket-level I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The background link service has shut down
    #[error("link service stopped")]
    ServiceStopped,
}

impl LinkError {
    /// Whether the caller may reasonably re-issue the operation later.
    ///
    /// Everything except a stopped service is recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ServiceStopped)
    }
}
