//! Peer connections: the transport seam, its implementations, and the
//! registry that negotiates one connection per remote participant

pub mod link;
pub mod loopback;
pub mod registry;
pub mod webrtc;

pub use link::{
    LinkContext, LinkState, PeerEvent, PeerEventKind, PeerLink, PeerLinkFactory, RemoteTrackInfo,
};
pub use loopback::{LoopbackLink, LoopbackNetwork};
pub use registry::{
    ConnectionState, NegotiationPhase, NegotiationRole, PeerChange, PeerRegistry, PeerSummary,
    RemovalReason, ReplaceStats,
};
pub use webrtc::{WebRtcLinkFactory, WebRtcPeerLink};
