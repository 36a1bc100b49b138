//! Error types for the transport module

/// WebSocket handshake timeout in seconds
pub(super) const WS_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur on the streaming connection
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout - handshake did not complete within {WS_CONNECT_TIMEOUT_SECS} seconds")]
    ConnectTimeout,
}
