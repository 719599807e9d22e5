//! Error types shared by the tomqtt bridges.

use thiserror::Error;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Opening the tty or control socket failed
    #[error("failed to open {path}: {reason}")]
    OpenFailed {
        /// Device or socket path
        path: String,
        /// Failure reason
        reason: String,
    },

    /// The transport reported end-of-file
    #[error("transport disconnected")]
    Disconnected,

    /// Read error on the transport
    #[error("transport read error: {0}")]
    Read(String),

    /// Write error on the transport
    #[error("transport write error: {0}")]
    Write(String),

    /// A write did not complete within the stall budget; retriable until
    /// the consecutive-block limit trips
    #[error("transport write blocked ({consecutive} consecutive)")]
    WriteBlocked {
        /// Consecutive blocked attempts so far
        consecutive: u32,
    },

    /// The transport wrote fewer bytes than requested
    #[error("short write: {wrote} of {len} bytes")]
    ShortWrite {
        /// Bytes actually written
        wrote: usize,
        /// Bytes requested
        len: usize,
    },

    /// The peer stopped answering; the transport is considered dead
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// The line buffer filled without a record separator
    #[error("line buffer full without a completed record")]
    BufferOverflow,

    /// The broker connection failed or was lost
    #[error("mqtt error: {0}")]
    Mqtt(String),

    /// IO error wrapper
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// A fatal error ends the session; anything else is retried or skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::WriteBlocked { .. })
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::Mqtt(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for BridgeError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        BridgeError::Mqtt(err.to_string())
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_writes_are_not_fatal() {
        assert!(!BridgeError::WriteBlocked { consecutive: 3 }.is_fatal());
        assert!(BridgeError::ShortWrite { wrote: 2, len: 9 }.is_fatal());
        assert!(BridgeError::Disconnected.is_fatal());
        assert!(BridgeError::BufferOverflow.is_fatal());
    }
}
