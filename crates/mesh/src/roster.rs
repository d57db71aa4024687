//! Room roster: who is present and who moderates
//!
//! The relay is authoritative for moderation. Locally the only decision is
//! self-election on entry, taken once, when the relay reports nobody as
//! moderator.

use crate::room_code::RoomCode;
use crate::signaling::protocol::{ExistingParticipant, KickPayload, ModeratorChangedPayload};
use crate::signaling::{PeerId, UserInfo};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Local user identity, supplied by the session provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Identity {
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
    /// Avatar URL
    #[serde(default)]
    pub image: Option<String>,
}

impl Identity {
    /// Create an identity without an avatar
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            image: None,
        }
    }

    /// Set the avatar URL
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Identity as carried in `userInfo`
    pub fn to_user_info(&self, is_moderator: bool) -> UserInfo {
        UserInfo {
            id: None,
            name: self.name.clone(),
            email: self.email.clone(),
            image: self.image.clone(),
            is_moderator,
        }
    }
}

/// One roster entry
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Participant {
    /// Relay id
    pub peer_id: PeerId,
    /// Display name
    pub name: String,
    /// Email address
    pub email: String,
    /// Avatar URL
    pub avatar_url: Option<String>,
    /// Moderator flag
    pub is_moderator: bool,
    /// Whether this is the local participant
    pub is_local: bool,
}

/// How a moderator change affected the local participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeratorTransition {
    /// Local participant became moderator
    Gained,
    /// Local participant stopped being moderator
    Lost,
    /// Local role did not change
    Unchanged,
}

/// Result of applying the entry roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOutcome {
    /// Participants seen for the first time
    pub joined: Vec<Participant>,
    /// Whether the local participant took the moderator role
    pub self_elected: bool,
}

struct Entry {
    peer_id: PeerId,
    info: UserInfo,
}

/// Participant table for one room membership
pub struct Roster {
    room: RoomCode,
    local_id: PeerId,
    identity: Identity,
    /// Remote entries in arrival order
    entries: Vec<Entry>,
    moderator: Option<PeerId>,
    self_elected: bool,
    snapshot: Arc<Vec<Participant>>,
}

impl Roster {
    /// Create a roster containing only the local participant
    pub fn new(room: RoomCode, local_id: PeerId, identity: Identity) -> Self {
        let mut roster = Self {
            room,
            local_id,
            identity,
            entries: Vec::new(),
            moderator: None,
            self_elected: false,
            snapshot: Arc::new(Vec::new()),
        };
        roster.refresh();
        roster
    }

    /// Room this roster belongs to
    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    /// Local relay id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Local identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current moderator, if known
    pub fn moderator_id(&self) -> Option<&str> {
        self.moderator.as_deref()
    }

    /// Whether the local participant moderates the room
    pub fn is_local_moderator(&self) -> bool {
        self.moderator.as_deref() == Some(self.local_id.as_str())
    }

    /// Local identity as sent to peers
    pub fn local_user_info(&self) -> UserInfo {
        self.identity.to_user_info(self.is_local_moderator())
    }

    /// Whether a remote participant is known
    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.iter().any(|e| e.peer_id == peer_id)
    }

    /// Remote participant's identity
    pub fn get(&self, peer_id: &str) -> Option<&UserInfo> {
        self.entries
            .iter()
            .find(|e| e.peer_id == peer_id)
            .map(|e| &e.info)
    }

    /// Number of participants, local included
    pub fn len(&self) -> usize {
        self.entries.len() + 1
    }

    /// Always false: the local participant is always present
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Copy-on-write snapshot, local participant first
    pub fn snapshot(&self) -> Arc<Vec<Participant>> {
        Arc::clone(&self.snapshot)
    }

    /// Apply the roster received on entry
    pub fn on_existing_participants(&mut self, participants: Vec<ExistingParticipant>) -> EntryOutcome {
        for p in &participants {
            if p.user_info.is_moderator {
                self.moderator = Some(p.socket_id.clone());
            }
        }

        let mut outcome = EntryOutcome::default();
        for p in participants {
            if let Some(new) = self.upsert(&p.socket_id, p.user_info) {
                outcome.joined.push(new);
            }
        }

        if self.moderator.is_none() && !self.self_elected {
            info!("No moderator in {}, taking the role", self.room);
            self.self_elected = true;
            self.moderator = Some(self.local_id.clone());
            outcome.self_elected = true;
        }

        self.refresh();
        outcome
    }

    /// Record a participant's identity; the first one seen wins
    ///
    /// Returns the new entry when the participant was not known before.
    pub fn upsert(&mut self, peer_id: &str, info: UserInfo) -> Option<Participant> {
        if peer_id == self.local_id || self.contains(peer_id) {
            return None;
        }

        debug!("Roster: {} is {}", peer_id, info.name);
        self.entries.push(Entry {
            peer_id: peer_id.to_string(),
            info,
        });
        self.refresh();
        self.participant(peer_id)
    }

    /// Drop a participant
    pub fn remove(&mut self, peer_id: &str) -> Option<Participant> {
        if !self.contains(peer_id) {
            return None;
        }
        let removed = self.participant(peer_id)?;
        self.entries.retain(|e| e.peer_id != peer_id);
        self.refresh();
        Some(removed)
    }

    /// Apply a relay decision about the moderator
    pub fn on_moderator_changed(&mut self, change: &ModeratorChangedPayload) -> ModeratorTransition {
        let was = self.is_local_moderator();
        self.moderator = Some(change.new_moderator_id.clone());
        let is = self.is_local_moderator();
        self.refresh();

        info!(
            "Moderator of {} is now {} ({})",
            self.room, change.new_moderator_name, change.new_moderator_id
        );

        match (was, is) {
            (false, true) => ModeratorTransition::Gained,
            (true, false) => ModeratorTransition::Lost,
            _ => ModeratorTransition::Unchanged,
        }
    }

    /// Build a kick request
    ///
    /// # Errors
    ///
    /// * `Error::NotModerator` - local participant does not moderate
    /// * `Error::PeerNotFound` - target is not in the room
    pub fn kick(&self, target: &str) -> Result<KickPayload> {
        if !self.is_local_moderator() {
            return Err(Error::NotModerator("remove participants".to_string()));
        }
        if !self.contains(target) {
            return Err(Error::PeerNotFound(target.to_string()));
        }

        Ok(KickPayload {
            room_id: self.room.to_string(),
            target_socket_id: target.to_string(),
        })
    }

    fn participant(&self, peer_id: &str) -> Option<Participant> {
        self.snapshot.iter().find(|p| p.peer_id == peer_id).cloned()
    }

    fn refresh(&mut self) {
        let moderator = self.moderator.as_deref();
        let mut list = Vec::with_capacity(self.entries.len() + 1);

        list.push(Participant {
            peer_id: self.local_id.clone(),
            name: self.identity.name.clone(),
            email: self.identity.email.clone(),
            avatar_url: self.identity.image.clone(),
            is_moderator: moderator == Some(self.local_id.as_str()),
            is_local: true,
        });
        for e in &self.entries {
            list.push(Participant {
                peer_id: e.peer_id.clone(),
                name: e.info.name.clone(),
                email: e.info.email.clone(),
                avatar_url: e.info.image.clone(),
                is_moderator: moderator == Some(e.peer_id.as_str()),
                is_local: false,
            });
        }

        self.snapshot = Arc::new(list);
    }
}
