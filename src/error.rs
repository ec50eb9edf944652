//! # Error Handling
//!
//! Error types for the whole library.
//!
//! Errors are grouped by the component that raises them: client lifecycle,
//! signaling transport, negotiation/WebRTC, and per-node send paths. Non-fatal
//! errors are emitted on the closest owning component (connection → node →
//! client) and never destroy ancestors; fatal errors trigger the client abort
//! path (destroy when no id was ever issued, disconnect otherwise).

use thiserror::Error;

/// Result type alias for lattice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for lattice-core
///
/// All variants carry owned strings so errors can travel on broadcast event
/// channels without borrowing from the component that raised them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Client Lifecycle Errors
    // ========================================================================
    /// Peer id failed validation
    #[error("Invalid peer id: {0}")]
    InvalidId(String),

    /// API key rejected by the signaling server
    #[error("Invalid API key: {0}")]
    InvalidKey(String),

    /// The requested peer id is already taken on the signaling server
    #[error("Peer id is unavailable: {0}")]
    UnavailableId(String),

    /// The client has been disconnected from the signaling server
    #[error("Client is disconnected from the signaling server. Call reconnect() to restore signaling.")]
    Disconnected,

    /// The client has been destroyed
    #[error("Client has been destroyed and can no longer be used.")]
    Destroyed,

    // ========================================================================
    // Signaling Transport Errors
    // ========================================================================
    /// WebSocket-level failure
    #[error("Socket error: {0}")]
    SocketError(String),

    /// The socket closed unexpectedly
    #[error("Socket closed: {0}")]
    SocketClosed(String),

    /// The signaling server reported an error or misbehaved
    #[error("Server error: {0}")]
    ServerError(String),

    /// Network-level failure reaching the signaling server
    #[error("Network error: {0}")]
    Network(String),

    /// The remote peer could not be reached through the signaling server
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    // ========================================================================
    // Negotiation / WebRTC Errors
    // ========================================================================
    /// A WebRTC operation failed
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// ICE negotiation reached the failed state
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The underlying transport closed
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    // ========================================================================
    // Send-path Errors
    // ========================================================================
    /// Attempted to send before the node/connection opened
    #[error("Connection to {0} is not open yet. Wait for the open event before sending.")]
    NotOpenYet(String),

    /// The node has no open connection to carry the payload
    #[error("No open connection to peer {0}.")]
    NoOpenConnection(String),

    /// The encoded payload exceeds the serializer's frame limit
    #[error("Message of {size} bytes exceeds the {limit}-byte limit")]
    MessageTooBig {
        /// Encoded payload size
        size: usize,
        /// Serializer frame limit
        limit: usize,
    },

    /// Payload encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether this error terminates the signaling session.
    ///
    /// Fatal errors run the client abort path: emit the error, then destroy
    /// the client if no id was ever issued, otherwise merely disconnect so
    /// established peer links survive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidKey(_)
                | Error::UnavailableId(_)
                | Error::ServerError(_)
                | Error::SocketClosed(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtc(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::SocketError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(Error::InvalidKey("bad".into()).is_fatal());
        assert!(Error::UnavailableId("taken".into()).is_fatal());
        assert!(Error::ServerError("boom".into()).is_fatal());
        assert!(Error::SocketClosed("eof".into()).is_fatal());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!Error::PeerUnavailable("bob".into()).is_fatal());
        assert!(!Error::WebRtc("ice".into()).is_fatal());
        assert!(!Error::NotOpenYet("bob".into()).is_fatal());
        assert!(!Error::NegotiationFailed("ice failed".into()).is_fatal());
        assert!(!Error::Disconnected.is_fatal());
    }

    #[test]
    fn test_message_too_big_display() {
        let err = Error::MessageTooBig {
            size: 20000,
            limit: 16300,
        };
        let msg = err.to_string();
        assert!(msg.contains("20000"));
        assert!(msg.contains("16300"));
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err = Error::SocketError("ws failure".into());
        let clone = err.clone();
        assert_eq!(err, clone);
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
