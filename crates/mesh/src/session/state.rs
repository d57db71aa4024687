//! Observable session state: lifecycle, snapshots and events

use crate::media::{CaptureMode, DeviceSelection, MediaErrorKind, TrackKind};
use crate::peer::{PeerSummary, RemovalReason};
use crate::roster::Participant;
use crate::room_code::RoomCode;
use crate::signaling::PeerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Session lifecycle
///
/// ```text
/// Idle -> Initializing -> [MediaDenied] -> Joining -> Active -> Closed
///                                             |          |
///                                             +-> SignalingError (retrying)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Nothing started
    Idle,
    /// Acquiring local media
    Initializing,
    /// No local media could be captured; continuing receive-only
    MediaDenied,
    /// Connecting to the relay
    Joining,
    /// In the room
    Active,
    /// Relay unreachable; retrying with backoff
    SignalingError,
    /// Left; every resource released
    Closed,
}

impl LifecycleState {
    /// Whether `join` may be called
    pub fn can_join(&self) -> bool {
        matches!(self, LifecycleState::Idle | LifecycleState::Closed)
    }

    /// Whether the session holds resources that `leave` must release
    pub fn is_live(&self) -> bool {
        !matches!(self, LifecycleState::Idle | LifecycleState::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Initializing => "initializing",
            LifecycleState::MediaDenied => "media-denied",
            LifecycleState::Joining => "joining",
            LifecycleState::Active => "active",
            LifecycleState::SignalingError => "signaling-error",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEntry {
    /// Sender relay id
    pub sender_id: PeerId,
    /// Sender display name
    pub sender_name: String,
    /// Body
    pub text: String,
    /// When it was sent
    pub time: DateTime<Utc>,
    /// Sent by the local participant
    pub is_local: bool,
}

/// Everything the view layer renders, replaced wholesale on every change
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Lifecycle state
    pub state: LifecycleState,
    /// Room, once the code was validated
    pub room: Option<RoomCode>,
    /// Relay-assigned local id while connected
    pub local_id: Option<PeerId>,
    /// Microphone track present and enabled
    pub audio_enabled: bool,
    /// Camera track present and enabled
    pub video_enabled: bool,
    /// What the initial capture obtained
    pub capture_mode: Option<CaptureMode>,
    /// Current device choice
    pub devices: DeviceSelection,
    /// Roster, local participant first
    pub participants: Arc<Vec<Participant>>,
    /// Peer connections
    pub peers: Arc<Vec<PeerSummary>>,
    /// Chat history
    pub chat: Arc<Vec<ChatEntry>>,
    /// Inline banner for the last media failure
    pub media_banner: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: LifecycleState::Idle,
            room: None,
            local_id: None,
            audio_enabled: false,
            video_enabled: false,
            capture_mode: None,
            devices: DeviceSelection::default(),
            participants: Arc::new(Vec::new()),
            peers: Arc::new(Vec::new()),
            chat: Arc::new(Vec::new()),
            media_banner: None,
        }
    }
}

impl SessionSnapshot {
    /// Whether the local participant moderates the room
    pub fn is_moderator(&self) -> bool {
        self.participants
            .iter()
            .any(|p| p.is_local && p.is_moderator)
    }
}

/// Something the view layer should react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Lifecycle moved
    StateChanged {
        /// Previous state
        from: LifecycleState,
        /// New state
        to: LifecycleState,
    },
    /// A participant appeared in the roster
    ParticipantJoined(Participant),
    /// A participant left the room
    ParticipantLeft {
        /// Relay id
        peer_id: PeerId,
        /// Display name, if known
        name: Option<String>,
        /// Relay-supplied reason
        reason: String,
    },
    /// The relay named a new moderator
    ModeratorChanged {
        /// Relay id
        peer_id: PeerId,
        /// Display name
        name: String,
    },
    /// The local participant now moderates the room
    BecameModerator,
    /// Media started flowing with a peer
    PeerConnected(PeerId),
    /// A peer connection went away
    PeerRemoved {
        /// Relay id
        peer_id: PeerId,
        /// Why
        reason: RemovalReason,
    },
    /// Local mic or camera toggled
    LocalMediaChanged {
        /// Microphone enabled
        audio: bool,
        /// Camera enabled
        video: bool,
    },
    /// An input or output device switch succeeded
    DeviceChanged {
        /// Track kind, `None` for the audio output
        kind: Option<TrackKind>,
        /// New device
        device_id: String,
    },
    /// Media failure to show as an inline banner
    MediaError {
        /// Failure class
        kind: MediaErrorKind,
        /// Banner text
        message: String,
    },
    /// A chat line arrived (or was sent)
    Chat(ChatEntry),
    /// The moderator removed us; show a blocking notice
    Kicked {
        /// Notice text
        message: String,
        /// Moderator name
        kicked_by: String,
    },
    /// The room code is malformed; show the error view and go home
    InvalidRoomCode {
        /// Code as typed
        code: String,
        /// Countdown before returning home
        redirect_in: Duration,
    },
    /// Relay connection lost; retry scheduled
    Reconnecting {
        /// Retry number, starting at 1
        attempt: u32,
        /// Delay before the retry
        delay: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_allowed_states() {
        assert!(LifecycleState::Idle.can_join());
        assert!(LifecycleState::Closed.can_join());
        assert!(!LifecycleState::Active.can_join());
        assert!(!LifecycleState::SignalingError.can_join());
        assert!(LifecycleState::MediaDenied.is_live());
        assert!(!LifecycleState::Closed.is_live());
    }

    #[test]
    fn test_snapshot_serializes_shared_collections() {
        let snapshot = SessionSnapshot {
            media_banner: Some("Camera is in use by another application".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["participants"].as_array().unwrap().is_empty());
        assert!(json["peers"].as_array().unwrap().is_empty());
        assert!(json["chat"].as_array().unwrap().is_empty());
        assert_eq!(
            json["media_banner"],
            "Camera is in use by another application"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(LifecycleState::SignalingError.to_string(), "signaling-error");
        assert_eq!(LifecycleState::Active.to_string(), "active");
    }
}
