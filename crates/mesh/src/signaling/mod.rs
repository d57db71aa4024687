//! Signaling: the relay wire contract and its transports

pub mod client;
pub mod memory;
pub mod protocol;
pub mod reconnect;
pub mod websocket;

pub use client::{SignalSender, SignalingClient, SignalingConnector, SignalingEvent, SignalingLink};
pub use memory::MemoryRelay;
pub use protocol::{
    Direction, IceCandidate, PeerId, SessionDescription, SignalingMessage, UserInfo,
};
pub use reconnect::{Backoff, ReconnectionPolicy};
pub use websocket::WebSocketConnector;
