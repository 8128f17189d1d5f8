//! Error types for editorial-sync

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Sync client error.
///
/// Errors are `Clone` because one connection-level failure is fanned out to
/// every pending call and every `on_error` listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The physical connection failed or reported an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation needed an open socket
    #[error("Not connected")]
    NotConnected,

    /// An operation needed an authenticated socket
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The server rejected a call. Displays the server's message as-is.
    #[error("{message}")]
    Protocol { code: Option<String>, message: String },

    /// The socket dropped while the call was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// The session was explicitly disconnected
    #[error("Session closed")]
    SessionClosed,

    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Frame encoding or decoding failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// The repository collaborator failed to issue a socket token
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Decorator error: {0}")]
    Decorator(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Build a protocol error from a server error payload, falling back to a
    /// call-specific message when the server sent none.
    pub fn protocol(code: &str, message: &str, fallback: &str) -> Self {
        let message = if message.is_empty() { fallback } else { message };
        SyncError::Protocol {
            code: (!code.is_empty()).then(|| code.to_string()),
            message: message.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Codec(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Repository(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_uses_server_message() {
        let err = SyncError::protocol("404", "Set not found", "Failed to get documents");
        assert_eq!(err.to_string(), "Set not found");
        assert!(matches!(err, SyncError::Protocol { code: Some(ref c), .. } if c == "404"));
    }

    #[test]
    fn test_protocol_error_falls_back() {
        let err = SyncError::protocol("", "", "Failed to get documents");
        assert_eq!(err.to_string(), "Failed to get documents");
        assert!(matches!(err, SyncError::Protocol { code: None, .. }));
    }

    #[test]
    fn test_not_authenticated_message() {
        assert_eq!(SyncError::NotAuthenticated.to_string(), "Not authenticated");
    }
}
