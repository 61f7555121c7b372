//! Error types for worldcomm
//!
//! All errors that can occur in coordinator and communication-server
//! operations are represented by the `CommError` enum. Authentication
//! failures carry their own `AuthError` sub-kind so callers can
//! distinguish clean rejections from retryable internal faults.

use crate::auth::AuthError;
use thiserror::Error;

/// Main error type for all worldcomm operations
///
/// The variants map to the error categories of the system design:
/// protocol (malformed or out-of-state message), auth, transport,
/// overflow (outbound queue full), config (invalid startup input) and
/// internal (invariant violation). Decode and I/O errors are carried
/// as their own variants and classify as protocol/transport
/// respectively.
#[derive(Error, Debug)]
pub enum CommError {
    /// Malformed or out-of-state message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Envelope declared a message type this build does not know.
    /// The raw bytes are retained so the caller can log them.
    #[error("Unknown message type {type_tag}")]
    UnknownMessageType { type_tag: i32, raw: Vec<u8> },

    /// Protobuf decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Authentication failed
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Underlying socket or WebRTC failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Outbound queue full
    #[error("Overflow: {0}")]
    Overflow(String),

    /// Invalid startup input
    #[error("Config error: {0}")]
    Config(String),

    /// Invariant violation; the offending peer is closed, the process
    /// continues
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed (config files, /version payload)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed (coordinator or identity URL)
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl CommError {
    /// WebSocket close code for this error category: 1008 (policy
    /// violation) for auth, 1011 (internal) for internal faults, 1000
    /// (normal) for everything that is routine teardown from the remote
    /// peer's point of view.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            CommError::Auth(_) => 1008,
            CommError::Internal(_) => 1011,
            _ => 1000,
        }
    }
}

/// Result type alias for worldcomm operations
pub type CommResult<T> = Result<T, CommError>;
