//! In-process relay
//!
//! Implements the relay side of the wire contract for any number of
//! sessions living in the same process: id assignment, rooms, message
//! routing, moderator tracking and kicks. The demo binary can host it, and
//! the integration tests run whole rooms on it.

use super::client::{SignalingConnector, SignalingLink};
use super::protocol::{
    ChatMessagePayload, ExistingParticipant, JoinRoomPayload, KickPayload, KickedPayload,
    ModeratorChangedPayload, PeerId, PeerJoinedPayload, PeerLeftPayload, SignalingMessage,
    UserInfo, UserMessagePayload,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Connection {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    room: Option<String>,
    info: UserInfo,
}

#[derive(Default)]
struct Room {
    /// Members in join order
    members: Vec<PeerId>,
    moderator: Option<PeerId>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    connections: HashMap<PeerId, Connection>,
    rooms: HashMap<String, Room>,
    opened: usize,
}

impl RelayState {
    fn deliver(&self, to: &str, msg: SignalingMessage) {
        match self.connections.get(to) {
            Some(conn) => {
                if conn.tx.send(msg).is_err() {
                    debug!("Relay: {} no longer reading", to);
                }
            }
            None => debug!("Relay: dropping message for unknown peer {}", to),
        }
    }

    fn broadcast(&self, room: &str, except: Option<&str>, msg: &SignalingMessage) {
        if let Some(room) = self.rooms.get(room) {
            for member in &room.members {
                if Some(member.as_str()) != except {
                    self.deliver(member, msg.clone());
                }
            }
        }
    }

    fn user_info(&self, peer_id: &str) -> UserInfo {
        self.connections
            .get(peer_id)
            .map(|c| c.info.clone())
            .unwrap_or_default()
    }

    fn handle(&mut self, from: &str, msg: SignalingMessage) {
        match msg {
            SignalingMessage::JoinRoom(p) => self.join(from, p),
            SignalingMessage::Offer(mut p) => {
                p.from = from.to_string();
                if let Some(to) = p.to.clone() {
                    self.deliver(&to, SignalingMessage::Offer(p));
                }
            }
            SignalingMessage::Answer(mut p) => {
                p.from = from.to_string();
                if let Some(to) = p.to.clone() {
                    self.deliver(&to, SignalingMessage::Answer(p));
                }
            }
            SignalingMessage::IceCandidate(mut p) => {
                p.from = from.to_string();
                if let Some(to) = p.to.clone() {
                    self.deliver(&to, SignalingMessage::IceCandidate(p));
                }
            }
            SignalingMessage::Kick(p) => self.kick(from, p),
            SignalingMessage::UserMessage(p) => self.chat(from, p),
            other => warn!(
                "Relay: ignoring client-sent {:?}",
                other.event_name(super::protocol::Direction::FromRelay)
            ),
        }
    }

    fn join(&mut self, from: &str, p: JoinRoomPayload) {
        let room_id = p.room_id.clone();

        // A second join from the same connection moves it
        self.leave(from, "rejoin");

        let room = self.rooms.entry(room_id.clone()).or_default();
        let existing: Vec<PeerId> = room.members.clone();
        let first = room.members.is_empty();
        room.members.push(from.to_string());
        if first {
            room.moderator = Some(from.to_string());
        }
        let moderator = room.moderator.clone();

        let info = UserInfo {
            id: None,
            name: p.user_name,
            email: p.user_email,
            image: p.user_image,
            is_moderator: first,
        };

        if let Some(conn) = self.connections.get_mut(from) {
            conn.room = Some(room_id.clone());
            conn.info = info.clone();
        }

        info!(
            "Relay: {} joined {} ({} already present)",
            from,
            room_id,
            existing.len()
        );

        let participants = existing
            .iter()
            .map(|id| {
                let mut user_info = self.user_info(id);
                user_info.is_moderator = moderator.as_deref() == Some(id.as_str());
                ExistingParticipant {
                    socket_id: id.clone(),
                    user_info,
                }
            })
            .collect();
        self.deliver(from, SignalingMessage::ExistingParticipants(participants));

        let joined = SignalingMessage::PeerJoined(PeerJoinedPayload {
            socket_id: from.to_string(),
            user_info: info,
        });
        self.broadcast(&room_id, Some(from), &joined);
    }

    fn kick(&mut self, from: &str, p: KickPayload) {
        let allowed = self
            .rooms
            .get(&p.room_id)
            .map(|r| r.moderator.as_deref() == Some(from) && r.members.contains(&p.target_socket_id))
            .unwrap_or(false);

        if !allowed {
            warn!("Relay: refusing kick of {} by {}", p.target_socket_id, from);
            return;
        }

        let kicked_by = self.user_info(from).name;
        self.deliver(
            &p.target_socket_id,
            SignalingMessage::Kicked(KickedPayload {
                message: "You have been removed from the meeting by the moderator".to_string(),
                kicked_by,
            }),
        );
        self.leave(&p.target_socket_id, "kicked");
    }

    fn chat(&mut self, from: &str, p: UserMessagePayload) {
        let msg = SignalingMessage::ChatMessage(ChatMessagePayload {
            user_id: from.to_string(),
            sender_name: p.sender_name,
            text: p.text,
            time: chrono::Utc::now().to_rfc3339(),
        });
        self.broadcast(&p.room_id, None, &msg);
    }

    /// Remove a connection from its room, notify the rest, re-elect if needed
    fn leave(&mut self, peer_id: &str, reason: &str) {
        let Some(room_id) = self
            .connections
            .get_mut(peer_id)
            .and_then(|c| c.room.take())
        else {
            return;
        };

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        room.members.retain(|m| m != peer_id);

        let mut new_moderator = None;
        if room.moderator.as_deref() == Some(peer_id) {
            room.moderator = room.members.first().cloned();
            new_moderator = room.moderator.clone();
        }
        let empty = room.members.is_empty();

        let left = SignalingMessage::PeerLeft(PeerLeftPayload {
            socket_id: peer_id.to_string(),
            reason: reason.to_string(),
            user_info: Some(self.user_info(peer_id)),
        });
        self.broadcast(&room_id, None, &left);

        if let Some(moderator) = new_moderator {
            let name = self.user_info(&moderator).name;
            info!("Relay: {} is now moderator of {}", moderator, room_id);
            self.broadcast(
                &room_id,
                None,
                &SignalingMessage::ModeratorChanged(ModeratorChangedPayload {
                    new_moderator_id: moderator,
                    new_moderator_name: name,
                }),
            );
        }

        if empty {
            self.rooms.remove(&room_id);
        }
    }

    fn disconnect(&mut self, peer_id: &str) {
        self.leave(peer_id, "disconnect");
        if self.connections.remove(peer_id).is_some() {
            debug!("Relay: {} disconnected", peer_id);
        }
    }
}

/// Removes a connection from the relay when its task ends, aborted or not
struct Departure {
    state: Arc<Mutex<RelayState>>,
    peer_id: PeerId,
}

impl Drop for Departure {
    fn drop(&mut self) {
        self.state.lock().disconnect(&self.peer_id);
    }
}

/// Shared in-process relay; clones talk to the same rooms
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    offline: Arc<AtomicBool>,
}

impl MemoryRelay {
    /// Create an empty relay
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections ever opened
    pub fn connection_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Members of a room in join order
    pub fn members(&self, room: &str) -> Vec<PeerId> {
        self.state
            .lock()
            .rooms
            .get(room)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    /// Current moderator of a room as the relay sees it
    pub fn moderator(&self, room: &str) -> Option<PeerId> {
        self.state.lock().rooms.get(room).and_then(|r| r.moderator.clone())
    }

    /// Deliver an arbitrary message to one connection
    pub fn inject(&self, to: &str, msg: SignalingMessage) {
        self.state.lock().deliver(to, msg);
    }

    /// Drop a connection from the relay side
    pub fn drop_connection(&self, peer_id: &str) {
        self.state.lock().disconnect(peer_id);
    }

    /// Refuse (or accept again) new connections
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingConnector for MemoryRelay {
    async fn open(&self, cancel: CancellationToken) -> Result<SignalingLink> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::SignalingError("Relay unreachable".to_string()));
        }

        let (outbound, mut from_client) = mpsc::unbounded_channel::<SignalingMessage>();
        let (to_client, inbound) = mpsc::unbounded_channel();

        let local_id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.opened += 1;
            let id = format!("peer-{}", state.next_id);
            state.connections.insert(
                id.clone(),
                Connection {
                    tx: to_client,
                    room: None,
                    info: UserInfo::default(),
                },
            );
            id
        };

        let departure = Departure {
            state: Arc::clone(&self.state),
            peer_id: local_id.clone(),
        };
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = from_client.recv() => match msg {
                        Some(msg) => departure.state.lock().handle(&departure.peer_id, msg),
                        None => break,
                    },
                }
            }
            drop(departure);
        });

        Ok(SignalingLink {
            local_id,
            outbound,
            inbound,
            tasks: vec![task],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::client::{SignalingClient, SignalingEvent};

    fn join(room: &str, from: &str, name: &str) -> SignalingMessage {
        SignalingMessage::JoinRoom(JoinRoomPayload {
            room_id: room.to_string(),
            from: from.to_string(),
            user_name: name.to_string(),
            user_email: format!("{}@example.com", name.to_lowercase()),
            user_image: None,
        })
    }

    async fn next(client: &mut SignalingClient) -> SignalingMessage {
        match tokio::time::timeout(std::time::Duration::from_secs(1), client.recv())
            .await
            .unwrap()
        {
            SignalingEvent::Message(msg) => msg,
            SignalingEvent::Disconnected => panic!("relay disconnected"),
        }
    }

    #[tokio::test]
    async fn test_join_announces_and_lists() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let mut a = SignalingClient::new(Arc::new(relay.clone()));
        let mut b = SignalingClient::new(Arc::new(relay.clone()));

        let a_id = a.connect(&cancel).await.unwrap();
        let b_id = b.connect(&cancel).await.unwrap();
        assert_ne!(a_id, b_id);

        a.send(join("abc-1234-xyz", &a_id, "Alice")).unwrap();
        match next(&mut a).await {
            SignalingMessage::ExistingParticipants(list) => assert!(list.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        b.send(join("abc-1234-xyz", &b_id, "Bob")).unwrap();
        match next(&mut b).await {
            SignalingMessage::ExistingParticipants(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].socket_id, a_id);
                assert!(list[0].user_info.is_moderator);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut a).await {
            SignalingMessage::PeerJoined(p) => {
                assert_eq!(p.socket_id, b_id);
                assert_eq!(p.user_info.name, "Bob");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(relay.members("abc-1234-xyz"), vec![a_id.clone(), b_id]);
        assert_eq!(relay.moderator("abc-1234-xyz"), Some(a_id));
    }

    #[tokio::test]
    async fn test_moderator_leaving_triggers_reelection() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let mut a = SignalingClient::new(Arc::new(relay.clone()));
        let mut b = SignalingClient::new(Arc::new(relay.clone()));
        let a_id = a.connect(&cancel).await.unwrap();
        let b_id = b.connect(&cancel).await.unwrap();

        a.send(join("abc-1234-xyz", &a_id, "Alice")).unwrap();
        next(&mut a).await;
        b.send(join("abc-1234-xyz", &b_id, "Bob")).unwrap();
        next(&mut b).await;

        a.disconnect();

        match next(&mut b).await {
            SignalingMessage::PeerLeft(p) => {
                assert_eq!(p.socket_id, a_id);
                assert_eq!(p.reason, "disconnect");
            }
            other => panic!("unexpected {:?}", other),
        }
        match next(&mut b).await {
            SignalingMessage::ModeratorChanged(p) => {
                assert_eq!(p.new_moderator_id, b_id);
                assert_eq!(p.new_moderator_name, "Bob");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_moderator_kick_is_refused() {
        let relay = MemoryRelay::new();
        let cancel = CancellationToken::new();
        let mut a = SignalingClient::new(Arc::new(relay.clone()));
        let mut b = SignalingClient::new(Arc::new(relay.clone()));
        let a_id = a.connect(&cancel).await.unwrap();
        let b_id = b.connect(&cancel).await.unwrap();

        a.send(join("abc-1234-xyz", &a_id, "Alice")).unwrap();
        next(&mut a).await;
        b.send(join("abc-1234-xyz", &b_id, "Bob")).unwrap();
        next(&mut b).await;
        next(&mut a).await;

        b.send(SignalingMessage::Kick(KickPayload {
            room_id: "abc-1234-xyz".to_string(),
            target_socket_id: a_id.clone(),
        }))
        .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(relay.members("abc-1234-xyz").len(), 2);
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_offline_relay_refuses() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);
        let mut client = SignalingClient::new(Arc::new(relay.clone()));
        let result = client.connect(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::SignalingError(_))));
        assert_eq!(relay.connection_count(), 0);
    }
}
