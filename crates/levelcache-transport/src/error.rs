//! Transport error types.

use thiserror::Error;

/// Errors raised by the connector, session, and manager layers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the remote store did not complete within the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was being dialed.
        addr: String,
        /// Configured dial timeout in milliseconds.
        timeout_ms: u64,
    },

    /// No live connection is bound to the session.
    #[error("not connected")]
    NotConnected,

    /// The underlying stream dropped while a request was in flight.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A request did not receive its response in time.
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Request id of the timed-out call.
        request_id: u64,
        /// Configured response timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A frame failed structural validation.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Why the frame was rejected.
        reason: String,
    },

    /// Frame header carried the wrong magic number.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Magic number this implementation speaks.
        expected: u32,
        /// Magic number found on the wire.
        got: u32,
    },

    /// Frame header carried an unsupported protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Version this implementation speaks.
        expected: u8,
        /// Version found on the wire.
        got: u8,
    },

    /// Frame payload exceeded the protocol cap.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u32,
        /// Maximum allowed payload size.
        max_size: u32,
    },

    /// Frame header carried an opcode this implementation does not know.
    #[error("unknown opcode: 0x{0:04X}")]
    UnknownOpcode(u16),

    /// A namespace name was not listed in the configured manifest.
    #[error("unknown namespace: {0}")]
    UnknownNamespace(String),

    /// The remote store answered with an error frame.
    #[error("remote error: {0}")]
    Remote(String),

    /// A wire message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
