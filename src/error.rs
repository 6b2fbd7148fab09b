//! Error types for mqwire.

use thiserror::Error;

/// Main error type for all mqwire operations.
#[derive(Debug, Error)]
pub enum MqwireError {
    /// I/O error on the physical socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error (governor options parsing).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation: malformed segment, bad reply status,
    /// acknowledgement out of sequence. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unknown or out-of-range opcode ("bad method code"). Fatal to the
    /// connection after being reported to the peer.
    #[error("bad method code: {0}")]
    BadOpcode(u8),

    /// The physical connection is gone. Callers may reconnect.
    #[error("connection closed")]
    ConnectionClosed,

    /// A fault raised by the peer's business logic, rethrown locally.
    /// Does not affect connection lifetime.
    #[error("remote fault: {0}")]
    Remote(String),

    /// Write queue full and did not drain within the configured timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Failure forwarding a message to the dead-letter destination.
    #[error("dead-letter forward failed: {0}")]
    DeadLetter(String),
}

impl MqwireError {
    /// Whether this error signals that the channel is gone (as opposed to a
    /// single failed call). A reconnect supervisor keys off this.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            MqwireError::Io(_)
                | MqwireError::ConnectionClosed
                | MqwireError::BackpressureTimeout
        )
    }
}

/// Result type alias using MqwireError.
pub type Result<T> = std::result::Result<T, MqwireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(MqwireError::ConnectionClosed.is_connectivity());
        assert!(MqwireError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_connectivity());
        assert!(MqwireError::BackpressureTimeout.is_connectivity());

        assert!(!MqwireError::Remote("boom".into()).is_connectivity());
        assert!(!MqwireError::Protocol("bad".into()).is_connectivity());
        assert!(!MqwireError::BadOpcode(0xEE).is_connectivity());
    }

    #[test]
    fn test_display_messages() {
        let e = MqwireError::BadOpcode(0x7F);
        assert!(e.to_string().contains("bad method code"));

        let e = MqwireError::Remote("queue not found".into());
        assert!(e.to_string().contains("queue not found"));
    }
}
