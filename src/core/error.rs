use std::io;
use thiserror::Error;

/// Error types for the tether link
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("Value {value} out of range [{min}, {max}] for parameter {id}")]
    OutOfRange {
        /// Parameter id
        id: u8,
        /// Rejected value
        value: i32,
        /// Lower bound
        min: i32,
        /// Upper bound
        max: i32,
    },

    #[error("Liveness lost: {0}")]
    LivenessLost(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Peer rejected request: {0}")]
    Rejected(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(u8),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new socket error
    pub fn socket(msg: impl Into<String>) -> Self {
        Error::Socket(msg.into())
    }

    /// Creates a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    /// Creates a new protocol mismatch error
    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Error::ProtocolMismatch(msg.into())
    }

    /// Creates a new liveness error
    pub fn liveness_lost(msg: impl Into<String>) -> Self {
        Error::LivenessLost(msg.into())
    }

    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new rejection error
    pub fn rejected(msg: impl Into<String>) -> Self {
        Error::Rejected(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true for errors caused by an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::protocol_mismatch("operand 5 echoed as 6");
        assert!(matches!(err, Error::ProtocolMismatch(_)));
        assert_eq!(err.to_string(), "Protocol mismatch: operand 5 echoed as 6");
        assert!(!err.is_timeout());
        assert!(Error::timeout("lock").is_timeout());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = Error::OutOfRange { id: 3, value: 101, min: 0, max: 100 };
        assert_eq!(err.to_string(), "Value 101 out of range [0, 100] for parameter 3");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
