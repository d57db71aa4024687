//! Transport seam for one peer connection

use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, PeerId, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Transport-level connection state reported by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Created, nothing exchanged
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may not come back
    Disconnected,
    /// ICE failed
    Failed,
    /// Closed locally
    Closed,
}

/// A remote track surfaced by a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrackInfo {
    /// Audio or video
    pub kind: TrackKind,
    /// Remote track id
    pub track_id: String,
    /// Remote stream id
    pub stream_id: String,
}

/// Something a link observed, delivered to the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// A local candidate to trickle to the remote side
    LocalCandidate(IceCandidate),
    /// Transport state moved
    StateChanged(LinkState),
    /// Remote media arrived
    RemoteTrack(RemoteTrackInfo),
}

/// Event tagged with the connection that produced it
///
/// Events whose `connection_id` no longer matches the live record are stale
/// (the record was replaced) and are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    /// Remote peer
    pub peer_id: PeerId,
    /// Connection instance
    pub connection_id: Uuid,
    /// Payload
    pub kind: PeerEventKind,
}

/// Everything a factory needs to build a link
#[derive(Debug, Clone)]
pub struct LinkContext {
    /// Local participant id
    pub local_id: PeerId,
    /// Remote participant id
    pub peer_id: PeerId,
    /// Fresh id for this connection instance
    pub connection_id: Uuid,
    /// Where the link reports events
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

impl LinkContext {
    /// Emit an event for this connection; a closed session loop is ignored
    pub fn emit(&self, kind: PeerEventKind) {
        let _ = self.events.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            kind,
        });
    }
}

/// One peer connection
///
/// `create_offer` and `create_answer` also install the result as the local
/// description.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track with a new sender
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Swap the track on the existing sender of that kind; no renegotiation
    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<()>;

    /// Create an offer and set it locally
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and set it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the remote side's description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; only valid once a remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear the connection down
    async fn close(&self) -> Result<()>;
}

/// Builds links for new peers
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a link for `ctx.peer_id`
    async fn create(&self, ctx: LinkContext) -> Result<Arc<dyn PeerLink>>;
}
