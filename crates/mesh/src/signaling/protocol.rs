//! Relay wire protocol
//!
//! Every message travels as a `{"event": <name>, "data": <payload>}` frame.
//! Messages the client sends use the `*-to-server` names for SDP and
//! candidates; the relay forwards them under the short names.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Relay-assigned participant identifier (one per relay connection)
pub type PeerId = String;

/// Event carrying the relay-assigned id, sent once right after connecting
pub const CONNECT_EVENT: &str = "connect";

/// One frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    /// Event name
    pub event: String,

    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of the `connect` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    /// Id assigned to this connection
    pub socket_id: PeerId,
}

/// Identity of a participant as carried by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Account id (not the relay id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Display name
    pub name: String,

    /// Email address
    #[serde(default)]
    pub email: String,

    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Moderator flag as known to the relay
    #[serde(default)]
    pub is_moderator: bool,
}

/// SDP type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Rollback
    Rollback,
}

/// Session description (`RTCSessionDescriptionInit` shape)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Wrap an SDP offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wrap an SDP answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate (`RTCIceCandidateInit` shape)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// `join-room`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    /// Room code
    pub room_id: String,
    /// Local relay id
    pub from: PeerId,
    /// Display name
    pub user_name: String,
    /// Email
    pub user_email: String,
    /// Avatar URL
    #[serde(default)]
    pub user_image: Option<String>,
}

/// `peer-joined`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerJoinedPayload {
    /// Newcomer's relay id
    pub socket_id: PeerId,
    /// Newcomer's identity
    pub user_info: UserInfo,
}

/// `peer-left`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeftPayload {
    /// Departed peer's relay id
    pub socket_id: PeerId,
    /// Why the peer left (disconnect, kicked, ...)
    #[serde(default)]
    pub reason: String,
    /// Departed peer's identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// `offer`/`answer` in both directions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    /// Sender relay id
    pub from: PeerId,
    /// Recipient relay id
    #[serde(default)]
    pub to: Option<PeerId>,
    /// Session description
    pub payload: SessionDescription,
    /// Sender identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
}

/// `ice-candidate` in both directions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    /// Sender relay id
    pub from: PeerId,
    /// Recipient relay id
    #[serde(default)]
    pub to: Option<PeerId>,
    /// Candidate; `None` marks end of gathering
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
}

/// One entry of `existing-participants`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExistingParticipant {
    /// Relay id
    pub socket_id: PeerId,
    /// Identity
    pub user_info: UserInfo,
}

/// `kick-user`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KickPayload {
    /// Room code
    pub room_id: String,
    /// Participant to remove
    pub target_socket_id: PeerId,
}

/// `kicked`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KickedPayload {
    /// Notice shown to the removed participant
    pub message: String,
    /// Name of the moderator who removed them
    pub kicked_by: String,
}

/// `moderator-changed`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeratorChangedPayload {
    /// Relay id of the new moderator
    pub new_moderator_id: PeerId,
    /// Display name of the new moderator
    pub new_moderator_name: String,
}

/// `user-message` (client → relay)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessagePayload {
    /// Room code
    pub room_id: String,
    /// Message body
    pub text: String,
    /// Display name of the sender
    pub sender_name: String,
}

/// `chat-message` (relay → client)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    /// Sender relay id
    pub user_id: PeerId,
    /// Display name of the sender
    pub sender_name: String,
    /// Message body
    pub text: String,
    /// RFC 3339 timestamp assigned by the relay
    pub time: String,
}

/// Which way a message travels; selects the event name on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → relay
    ToRelay,
    /// Relay → client
    FromRelay,
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Enter a room
    JoinRoom(JoinRoomPayload),
    /// SDP offer
    Offer(SdpPayload),
    /// SDP answer
    Answer(SdpPayload),
    /// Trickled ICE candidate
    IceCandidate(IceCandidatePayload),
    /// Someone entered the room
    PeerJoined(PeerJoinedPayload),
    /// Someone left the room
    PeerLeft(PeerLeftPayload),
    /// Roster at the moment of entry
    ExistingParticipants(Vec<ExistingParticipant>),
    /// Moderator asks the relay to remove someone
    Kick(KickPayload),
    /// This participant was removed
    Kicked(KickedPayload),
    /// Relay elected a new moderator
    ModeratorChanged(ModeratorChangedPayload),
    /// Chat line delivered by the relay
    ChatMessage(ChatMessagePayload),
    /// Chat line sent to the relay
    UserMessage(UserMessagePayload),
}

impl SignalingMessage {
    /// Event name for this message in the given direction
    pub fn event_name(&self, direction: Direction) -> &'static str {
        let to_relay = direction == Direction::ToRelay;
        match self {
            SignalingMessage::JoinRoom(_) => "join-room",
            SignalingMessage::Offer(_) if to_relay => "offer-to-server",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) if to_relay => "answer-to-server",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::IceCandidate(_) if to_relay => "ice-candidate-to-server",
            SignalingMessage::IceCandidate(_) => "ice-candidate",
            SignalingMessage::PeerJoined(_) => "peer-joined",
            SignalingMessage::PeerLeft(_) => "peer-left",
            SignalingMessage::ExistingParticipants(_) => "existing-participants",
            SignalingMessage::Kick(_) => "kick-user",
            SignalingMessage::Kicked(_) => "kicked",
            SignalingMessage::ModeratorChanged(_) => "moderator-changed",
            SignalingMessage::ChatMessage(_) => "chat-message",
            SignalingMessage::UserMessage(_) => "user-message",
        }
    }

    /// Relay id of the participant that produced this message, if carried
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalingMessage::JoinRoom(p) => Some(&p.from),
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => Some(&p.from),
            SignalingMessage::IceCandidate(p) => Some(&p.from),
            SignalingMessage::PeerJoined(p) => Some(&p.socket_id),
            SignalingMessage::PeerLeft(p) => Some(&p.socket_id),
            SignalingMessage::ChatMessage(p) => Some(&p.user_id),
            SignalingMessage::ExistingParticipants(_)
            | SignalingMessage::Kick(_)
            | SignalingMessage::Kicked(_)
            | SignalingMessage::ModeratorChanged(_)
            | SignalingMessage::UserMessage(_) => None,
        }
    }

    /// Convert to a wire frame
    pub fn to_frame(&self, direction: Direction) -> Result<Frame> {
        let data = match self {
            SignalingMessage::JoinRoom(p) => serde_json::to_value(p),
            SignalingMessage::Offer(p) | SignalingMessage::Answer(p) => serde_json::to_value(p),
            SignalingMessage::IceCandidate(p) => serde_json::to_value(p),
            SignalingMessage::PeerJoined(p) => serde_json::to_value(p),
            SignalingMessage::PeerLeft(p) => serde_json::to_value(p),
            SignalingMessage::ExistingParticipants(p) => serde_json::to_value(p),
            SignalingMessage::Kick(p) => serde_json::to_value(p),
            SignalingMessage::Kicked(p) => serde_json::to_value(p),
            SignalingMessage::ModeratorChanged(p) => serde_json::to_value(p),
            SignalingMessage::ChatMessage(p) => serde_json::to_value(p),
            SignalingMessage::UserMessage(p) => serde_json::to_value(p),
        }
        .map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling message: {}", e))
        })?;

        Ok(Frame {
            event: self.event_name(direction).to_string(),
            data,
        })
    }

    /// Parse a wire frame
    ///
    /// Returns `Ok(None)` for events this client does not handle, so the
    /// relay can add events without breaking older clients.
    pub fn from_frame(frame: Frame) -> Result<Option<Self>> {
        fn payload<T: serde::de::DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T> {
            serde_json::from_value(data).map_err(|e| {
                Error::SerializationError(format!("Invalid {} payload: {}", event, e))
            })
        }

        let event = frame.event.as_str();
        let data = frame.data;
        let msg = match event {
            "join-room" => SignalingMessage::JoinRoom(payload(event, data)?),
            "offer" | "offer-to-server" => SignalingMessage::Offer(payload(event, data)?),
            "answer" | "answer-to-server" => SignalingMessage::Answer(payload(event, data)?),
            "ice-candidate" | "ice-candidate-to-server" => {
                SignalingMessage::IceCandidate(payload(event, data)?)
            }
            "peer-joined" => SignalingMessage::PeerJoined(payload(event, data)?),
            "peer-left" => SignalingMessage::PeerLeft(payload(event, data)?),
            "existing-participants" => {
                SignalingMessage::ExistingParticipants(payload(event, data)?)
            }
            "kick-user" => SignalingMessage::Kick(payload(event, data)?),
            "kicked" => SignalingMessage::Kicked(payload(event, data)?),
            "moderator-changed" => SignalingMessage::ModeratorChanged(payload(event, data)?),
            "chat-message" => SignalingMessage::ChatMessage(payload(event, data)?),
            "user-message" => SignalingMessage::UserMessage(payload(event, data)?),
            _ => return Ok(None),
        };

        Ok(Some(msg))
    }

    /// Convert message to JSON string
    pub fn to_json(&self, direction: Direction) -> Result<String> {
        let frame = self.to_frame(direction)?;
        serde_json::to_string(&frame).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize signaling frame: {}", e))
        })
    }

    /// Parse message from JSON string
    pub fn from_json(json: &str) -> Result<Option<Self>> {
        let frame: Frame = serde_json::from_str(json).map_err(|e| {
            Error::SerializationError(format!("Failed to deserialize signaling frame: {}", e))
        })?;
        Self::from_frame(frame)
    }
}
