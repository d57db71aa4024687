//! Full-mesh call orchestration
//!
//! Every participant in a room keeps one independent WebRTC connection to
//! every other participant. This crate is the client-side core: it creates,
//! negotiates, monitors and tears down those connections, keeps the roster
//! and moderator role in sync with the signaling relay, and keeps local
//! capture devices attached to every live connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  View layer (reads snapshots + events, calls the API)    │
//! │  ↓                                                        │
//! │  SessionController  (single owner, one event loop)        │
//! │  ├─ SignalingClient     → relay (WebSocket / in-process)  │
//! │  ├─ MediaDeviceManager  → capture backend, surfaces       │
//! │  ├─ Roster              → identities, moderator           │
//! │  └─ PeerRegistry        → one PeerLink per remote peer    │
//! │        └─ webrtc-rs RTCPeerConnection / loopback          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use vido_mesh::RoomCode;
//! use vido_mesh::config::IceServerConfig;
//!
//! assert!(RoomCode::parse("abc-1234-xyz").is_ok());
//! assert!(RoomCode::parse("ABC123").is_err());
//!
//! let servers = IceServerConfig::for_turn_domain("turn.example.com", "user", "pass");
//! assert_eq!(servers.len(), 4);
//! ```
//!
//! ## In-process room
//!
//! ```
//! use std::sync::Arc;
//! use vido_mesh::config::MeshConfig;
//! use vido_mesh::media::SyntheticBackend;
//! use vido_mesh::peer::LoopbackNetwork;
//! use vido_mesh::session::{LifecycleState, SessionController};
//! use vido_mesh::signaling::MemoryRelay;
//! use vido_mesh::Identity;
//!
//! # tokio_test::block_on(async {
//! let relay = MemoryRelay::new();
//! let mut session = SessionController::new(
//!     MeshConfig::default(),
//!     Arc::new(relay.clone()),
//!     Arc::new(LoopbackNetwork::new()),
//!     Arc::new(SyntheticBackend::with_default_devices()),
//! )?;
//!
//! session.join("abc-1234-xyz", Identity::new("Alice", "alice@example.com")).await?;
//! assert_eq!(session.state(), LifecycleState::Active);
//!
//! session.leave().await;
//! assert_eq!(session.state(), LifecycleState::Closed);
//! # Ok::<(), vido_mesh::Error>(())
//! # }).unwrap();
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod error;
pub mod media;
pub mod peer;
pub mod room_code;
pub mod roster;
pub mod session;
pub mod signaling;

pub use config::{IceServerConfig, MeshConfig};
pub use directory::{HttpRoomDirectory, Meeting, RoomDirectory};
pub use error::{Error, ErrorCategory, Result};
pub use room_code::RoomCode;
pub use roster::{Identity, Participant};
pub use session::{
    LifecycleState, SessionController, SessionEvent, SessionHandle, SessionSnapshot,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
