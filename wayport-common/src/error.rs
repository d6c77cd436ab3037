//! Error types for `Wayport`

use thiserror::Error;
use uuid::Uuid;

/// Main error type for `Wayport` operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No tunnel connection matches the inbound host/path
    #[error("No tunnel registered for {host}{path}")]
    RoutingMiss { host: String, path: String },

    /// The tunnel client could not reach its local service
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The tunnel connection went away while an exchange was in flight
    #[error("Tunnel peer disconnected")]
    PeerDisconnected,

    /// A (host, path-prefix) route is already owned by a live connection
    #[error("Route already registered: {0}")]
    DuplicateRegistration(String),

    /// A virtual stream was destroyed by the peer or locally
    #[error("Stream aborted: {0}")]
    StreamAbort(String),

    /// A frame referenced a request id that has no registered stream
    #[error("Unknown stream {0}")]
    UnknownStream(Uuid),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TunnelError {
    /// Public-facing HTTP status for an error that ends an exchange.
    pub fn status_code(&self) -> u16 {
        match self {
            TunnelError::RoutingMiss { .. } => 404,
            TunnelError::UpstreamUnreachable(_) | TunnelError::StreamAbort(_) => 502,
            TunnelError::Timeout(_) => 504,
            _ => 500,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<bincode_next::error::EncodeError> for TunnelError {
    fn from(err: bincode_next::error::EncodeError) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}

impl From<bincode_next::error::DecodeError> for TunnelError {
    fn from(err: bincode_next::error::DecodeError) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}
