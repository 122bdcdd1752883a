//! Error types for the voicebridge gateway.

use thiserror::Error;

/// Errors that can occur while bridging a call.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Connection to a remote endpoint failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote endpoint
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Session negotiation error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Call-control API error
    #[error("Call control error: {0}")]
    CallControl(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
