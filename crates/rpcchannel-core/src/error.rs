//! Error types for rpcchannel.
//!
//! `RpcError` is the crate-wide error. The three outcomes a caller of
//! [`RpcClient::call`](crate::RpcClient::call) must handle are all variants of it:
//! a remote failure (`Remote`), a lost session (`Disconnected`), or a local
//! fault while encoding or decoding payloads.

use crate::protocol::ErrorType;
use std::fmt;
use thiserror::Error;

/// Main error type for rpcchannel.
#[derive(Debug, Error)]
pub enum RpcError {
    // Wire-level violations; fatal for the session that saw them
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Remote call completed with an error record
    #[error(transparent)]
    Remote(#[from] RpcException),

    #[error("Session disconnected")]
    Disconnected,

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("Noise handshake failed: {message}")]
    Handshake { message: String },

    // Serialization errors
    #[error("Payload error: {message}")]
    Payload {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for rpcchannel operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Payload {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<snow::Error> for RpcError {
    fn from(err: snow::Error) -> Self {
        RpcError::Handshake {
            message: err.to_string(),
        }
    }
}

impl RpcError {
    /// Whether this error ends the session it occurred on.
    ///
    /// Remote exceptions and payload errors only fail the single call.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RpcError::Remote(_) | RpcError::Payload { .. })
    }

    /// The remote exception, if the call failed on the peer.
    pub fn as_remote(&self) -> Option<&RpcException> {
        match self {
            RpcError::Remote(exception) => Some(exception),
            _ => None,
        }
    }
}

/// Violations of the line protocol.
///
/// Any of these terminates the session that observed it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("{kind} record is missing field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("{kind} record must not carry field `{field}`")]
    UnexpectedField { kind: &'static str, field: &'static str },

    #[error("call id must be non-zero")]
    ZeroCallId,

    #[error("no pending call with id {0}")]
    UnknownCallId(u64),

    #[error("call id {0} is already in flight")]
    DuplicateCallId(u64),

    #[error("{side} does not accept {kind} records")]
    UnexpectedMessage {
        side: &'static str,
        kind: &'static str,
    },

    #[error("record of {len} bytes exceeds maximum {max}")]
    LineTooLong { len: usize, max: usize },

    #[error("record is not valid UTF-8")]
    InvalidUtf8,

    #[error("stream ended in the middle of a record")]
    TruncatedRecord,
}

/// A remote call that completed with an error record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcException {
    pub error_type: ErrorType,
    pub message: String,
    /// Source file on the remote side, when reported.
    pub file: Option<String>,
    /// Source line on the remote side, when reported.
    pub line: Option<u32>,
}

impl RpcException {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            file: None,
            line: None,
        }
    }
}

impl fmt::Display for RpcException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remote {}: {}", self.error_type, self.message)?;
        if let Some(file) = &self.file {
            write!(f, " ({}:{})", file, self.line.unwrap_or(0))?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcException {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::from(ProtocolError::UnknownCallId(7));
        assert_eq!(err.to_string(), "Protocol error: no pending call with id 7");
    }

    #[test]
    fn test_exception_display_with_origin() {
        let exception = RpcException {
            error_type: ErrorType::NotImplemented,
            message: "Calc.sub".into(),
            file: Some("calc.rs".into()),
            line: Some(12),
        };
        assert_eq!(
            exception.to_string(),
            "Remote notImplemented: Calc.sub (calc.rs:12)"
        );
    }

    #[test]
    fn test_fatal_errors() {
        assert!(RpcError::Disconnected.is_fatal());
        assert!(RpcError::from(ProtocolError::ZeroCallId).is_fatal());
        assert!(!RpcError::Remote(RpcException::new(ErrorType::InternalError, "boom")).is_fatal());
    }
}
