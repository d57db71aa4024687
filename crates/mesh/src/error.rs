//! Error types for the mesh orchestrator

use crate::media::MediaError;

/// Result type alias using the mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error families, used by the view layer to pick a presentation
/// (banner, error view, silent log).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Local capture failed; the session degrades instead of aborting
    MediaAcquisition,
    /// Relay unreachable or dropped; retry/reconnect
    Signaling,
    /// Malformed or stale SDP/candidate; dropped and logged
    Negotiation,
    /// A single peer's transport failed; only that peer is torn down
    ConnectionLifecycle,
    /// Caller error (bad room code, bad config, not allowed)
    Usage,
    /// Everything else
    Internal,
}

/// Errors that can occur in mesh session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Room code does not match the `xxx-xxxx-xxx` format
    #[error("Invalid room code: {0}")]
    InvalidRoomCode(String),

    /// Room code is well formed but unknown or inactive
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Local media acquisition failed
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// SDP or candidate could not be applied
    #[error("Negotiation error with peer {peer_id}: {reason}")]
    Negotiation {
        /// Remote peer
        peer_id: String,
        /// What went wrong
        reason: String,
    },

    /// Peer transport failed or disconnected
    #[error("Connection to peer {peer_id} lost: {reason}")]
    ConnectionLifecycle {
        /// Remote peer
        peer_id: String,
        /// What went wrong
        reason: String,
    },

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Mesh is at capacity
    #[error("Maximum peer limit reached ({0})")]
    PeerLimitReached(usize),

    /// Operation requires moderator rights
    #[error("Only the moderator can {0}")]
    NotModerator(String),

    /// Operation not valid in the current lifecycle state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Current lifecycle state
        state: String,
    },

    /// Result arrived after the session generation it belonged to ended
    #[error("Operation cancelled by session teardown")]
    Cancelled,

    /// Room service request failed
    #[error("Room service error: {0}")]
    RoomService(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Family this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Media(_) => ErrorCategory::MediaAcquisition,
            Error::SignalingError(_) | Error::WebSocketError(_) => ErrorCategory::Signaling,
            Error::Negotiation { .. } => ErrorCategory::Negotiation,
            Error::ConnectionLifecycle { .. } | Error::WebRtcError(_) => {
                ErrorCategory::ConnectionLifecycle
            }
            Error::InvalidConfig(_)
            | Error::InvalidRoomCode(_)
            | Error::RoomNotFound(_)
            | Error::PeerNotFound(_)
            | Error::PeerLimitReached(_)
            | Error::NotModerator(_)
            | Error::InvalidState { .. } => ErrorCategory::Usage,
            Error::Cancelled
            | Error::RoomService(_)
            | Error::SerializationError(_)
            | Error::InternalError(_)
            | Error::IoError(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::RoomService(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is confined to a single peer
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerLimitReached(_)
                | Error::Negotiation { .. }
                | Error::ConnectionLifecycle { .. }
                | Error::WebRtcError(_)
        )
    }

    pub(crate) fn negotiation(peer_id: &str, reason: impl Into<String>) -> Self {
        Error::Negotiation {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidRoomCode("ABC123".to_string());
        assert_eq!(err.to_string(), "Invalid room code: ABC123");
    }

    #[test]
    fn test_relay_errors_are_retryable() {
        assert!(Error::SignalingError("relay closed".into()).is_retryable());
        assert!(Error::WebSocketError("connection reset".into()).is_retryable());
        assert!(!Error::InvalidRoomCode("ABC123".into()).is_retryable());
        assert!(!Error::negotiation("p", "bad sdp").is_retryable());
    }

    #[test]
    fn test_peer_errors_stay_local_to_one_link() {
        assert!(Error::PeerNotFound("peer-7".into()).is_peer_error());
        assert!(Error::negotiation("peer-2", "stale answer").is_peer_error());
        assert!(!Error::SignalingError("relay closed".into()).is_peer_error());
    }

    #[test]
    fn test_media_error_category() {
        let err = Error::from(MediaError::new(MediaErrorKind::DeviceBusy, "in use"));
        assert_eq!(err.category(), ErrorCategory::MediaAcquisition);
        assert_eq!(
            Error::SignalingError("x".into()).category(),
            ErrorCategory::Signaling
        );
        assert_eq!(
            Error::negotiation("p", "x").category(),
            ErrorCategory::Negotiation
        );
    }

    #[test]
    fn test_stdin_failure_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed").into();
        assert!(matches!(err, Error::IoError(_)));
    }
}
