//! Error types for the XRView environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// No live session with the robot bridge
    #[error("Not connected to robot bridge")]
    NotConnected,

    /// Transport-level failure (socket closed, publish rejected, etc.)
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A message type tag the bridge does not know
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// A message arrived whose payload does not match the subscribed type
    #[error("Type mismatch on {topic}: expected {expected}, got {actual}")]
    TypeMismatch {
        topic: String,
        expected: String,
        actual: String,
    },

    /// Packet serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Asset fetch failed (missing file, HTTP error, parse error)
    #[error("Resource fetch failed for {url}: {reason}")]
    ResourceError { url: String, reason: String },

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }

    /// Creates a resource fetch error.
    pub fn resource(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ResourceError {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
