//! Session controller: the single owner of one room membership
//!
//! The controller owns the relay connection, the local capture set, the
//! roster and the peer registry. Relay messages and link events arrive on
//! channels and are applied one at a time through [`SessionController::handle_input`],
//! so none of the owned tables need locking. The view layer reads
//! [`SessionSnapshot`]s from a watch channel and [`SessionEvent`]s from an
//! unbounded channel.

use super::generation::{Generation, GenerationGuard, TeardownHandle};
use super::state::{ChatEntry, LifecycleState, SessionEvent, SessionSnapshot};
use crate::config::MeshConfig;
use crate::directory::RoomDirectory;
use crate::media::{
    CaptureMode, DeviceList, MediaBackend, MediaDeviceManager, MediaError, MediaErrorKind,
    RenderSurface, TrackKind,
};
use crate::peer::{PeerChange, PeerEvent, PeerLinkFactory, PeerRegistry};
use crate::roster::{Identity, ModeratorTransition, Roster};
use crate::room_code::RoomCode;
use crate::signaling::protocol::{JoinRoomPayload, UserMessagePayload};
use crate::signaling::{
    Direction, SignalingClient, SignalingConnector, SignalingEvent, SignalingMessage,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// One unit of work for the session loop
#[derive(Debug)]
pub enum SessionInput {
    /// Something from the relay
    Signal(SignalingEvent),
    /// Something from a peer link
    Peer(PeerEvent),
    /// The live generation was cancelled from outside
    Cancelled,
}

/// Orchestrates one participant's membership in a mesh room
pub struct SessionController {
    config: MeshConfig,
    signaling: SignalingClient,
    factory: Arc<dyn PeerLinkFactory>,
    media: MediaDeviceManager,
    directory: Option<Arc<dyn RoomDirectory>>,

    guard: GenerationGuard,
    generation: Generation,
    state: LifecycleState,

    room: Option<RoomCode>,
    identity: Identity,
    roster: Option<Roster>,
    peers: Option<PeerRegistry>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,

    chat: Arc<Vec<ChatEntry>>,
    capture_mode: Option<CaptureMode>,
    media_banner: Option<String>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Create an idle session
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before use
    /// * `connector` - Relay transport
    /// * `factory` - Peer connection transport
    /// * `backend` - Local capture devices
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: MeshConfig,
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerLinkFactory>,
        backend: Arc<dyn MediaBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let guard = GenerationGuard::new();
        let generation = guard.current();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        Ok(Self {
            config,
            signaling: SignalingClient::new(connector),
            factory,
            media: MediaDeviceManager::new(backend),
            directory: None,
            guard,
            generation,
            state: LifecycleState::Idle,
            room: None,
            identity: Identity::default(),
            roster: None,
            peers: None,
            peer_tx,
            peer_rx,
            chat: Arc::new(Vec::new()),
            capture_mode: None,
            media_banner: None,
            events_tx,
            events_rx: Some(events_rx),
            snapshot_tx,
        })
    }

    /// Check room codes against a directory before joining
    pub fn with_directory(mut self, directory: Arc<dyn RoomDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Relay-assigned local id while connected
    pub fn local_id(&self) -> Option<&str> {
        self.signaling.local_id()
    }

    /// Room of the current membership
    pub fn room(&self) -> Option<&RoomCode> {
        self.room.as_ref()
    }

    /// Peer connections of the current membership
    pub fn peers(&self) -> Option<&PeerRegistry> {
        self.peers.as_ref()
    }

    /// Roster of the current membership
    pub fn roster(&self) -> Option<&Roster> {
        self.roster.as_ref()
    }

    /// Local capture
    pub fn media(&self) -> &MediaDeviceManager {
        &self.media
    }

    /// Take the event stream; only the first call gets it
    ///
    /// Events are buffered until taken.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Watch snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Handle that cancels the session from another task
    pub fn teardown_handle(&self) -> TeardownHandle {
        self.guard.teardown_handle()
    }

    /// Build the current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        let enabled = |kind| {
            self.media
                .track(kind)
                .map(|t| t.is_enabled())
                .unwrap_or(false)
        };

        SessionSnapshot {
            state: self.state,
            room: self.room.clone(),
            local_id: self.signaling.local_id().map(str::to_string),
            audio_enabled: enabled(TrackKind::Audio),
            video_enabled: enabled(TrackKind::Video),
            capture_mode: self.capture_mode,
            devices: self.media.selection().clone(),
            participants: self
                .roster
                .as_ref()
                .map(Roster::snapshot)
                .unwrap_or_default(),
            peers: self
                .peers
                .as_ref()
                .map(PeerRegistry::snapshot)
                .unwrap_or_default(),
            chat: Arc::clone(&self.chat),
            media_banner: self.media_banner.clone(),
        }
    }

    /// Enter a room
    ///
    /// Validates the code before anything else, captures local media with
    /// graceful degradation, connects to the relay and announces the join.
    /// If the relay cannot be reached the session retries according to the
    /// reconnection policy before giving up.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidRoomCode` - malformed code; nothing was started
    /// * `Error::RoomNotFound` - the directory does not know the code
    /// * `Error::Cancelled` - the session was torn down meanwhile
    /// * `Error::SignalingError` - relay unreachable after every retry
    #[instrument(skip_all, fields(room = %room))]
    pub async fn join(&mut self, room: &str, identity: Identity) -> Result<()> {
        if !self.state.can_join() {
            return Err(Error::InvalidState {
                operation: "join",
                state: self.state.to_string(),
            });
        }

        let code = match RoomCode::parse(room) {
            Ok(code) => code,
            Err(e) => {
                warn!("Rejecting malformed room code {:?}", room);
                self.emit(SessionEvent::InvalidRoomCode {
                    code: room.to_string(),
                    redirect_in: self.config.return_home_countdown(),
                });
                return Err(e);
            }
        };

        let generation = self.guard.current();
        self.generation = generation.clone();

        if let Some(directory) = self.directory.clone() {
            let lookup = tokio::select! {
                _ = generation.token().cancelled() => return Err(Error::Cancelled),
                lookup = directory.get_room(&code) => lookup,
            };
            let meeting = lookup?;
            if !meeting.is_joinable(Utc::now()) {
                warn!("Room {} is no longer active", code);
                return Err(Error::RoomNotFound(code.to_string()));
            }
        }

        self.room = Some(code);
        self.identity = identity;
        self.chat = Arc::new(Vec::new());
        self.media_banner = None;
        self.set_state(LifecycleState::Initializing);

        let outcome = tokio::select! {
            _ = generation.token().cancelled() => None,
            outcome = self.media.acquire_initial() => Some(outcome),
        };
        let Some(outcome) = outcome.filter(|_| self.guard.is_current(&generation)) else {
            info!("Join cancelled during media capture");
            self.teardown().await;
            return Err(Error::Cancelled);
        };

        self.capture_mode = Some(outcome.mode);
        if let Some(error) = &outcome.error {
            self.raise_media_error(error);
        }
        if outcome.mode == CaptureMode::None {
            self.set_state(LifecycleState::MediaDenied);
        }

        self.set_state(LifecycleState::Joining);
        match self.connect_and_join(&generation).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => {
                self.teardown().await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                warn!("Relay unreachable: {}", e);
                self.set_state(LifecycleState::SignalingError);
                self.reconnect(&generation).await
            }
        }
    }

    async fn connect_and_join(&mut self, generation: &Generation) -> Result<()> {
        let local_id = tokio::select! {
            _ = generation.token().cancelled() => return Err(Error::Cancelled),
            connected = self.signaling.connect(generation.token()) => connected?,
        };

        let sender = self
            .signaling
            .sender()
            .ok_or_else(|| Error::SignalingError("Relay connection closed".to_string()))?;
        let room = self
            .room
            .clone()
            .ok_or_else(|| Error::InternalError("Joining without a room".to_string()))?;

        // Relay ids are per connection, so everything keyed by them starts fresh
        self.roster = Some(Roster::new(
            room.clone(),
            local_id.clone(),
            self.identity.clone(),
        ));
        self.peers = Some(PeerRegistry::new(
            local_id.clone(),
            self.identity.to_user_info(false),
            Arc::clone(&self.factory),
            sender,
            self.peer_tx.clone(),
            &self.config,
        ));

        self.signaling
            .send(SignalingMessage::JoinRoom(JoinRoomPayload {
                room_id: room.to_string(),
                from: local_id.clone(),
                user_name: self.identity.name.clone(),
                user_email: self.identity.email.clone(),
                user_image: self.identity.image.clone(),
            }))?;

        info!("Joined room {} as {}", room, local_id);
        self.set_state(LifecycleState::Active);
        Ok(())
    }

    async fn reconnect(&mut self, generation: &Generation) -> Result<()> {
        let mut backoff = self.config.reconnect.schedule();
        let mut last_error = Error::SignalingError("Relay connection lost".to_string());

        for (attempt, delay) in backoff.by_ref() {
            info!("Reconnecting to relay in {:?} (attempt {})", delay, attempt);
            self.emit(SessionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = generation.token().cancelled() => {
                    self.teardown().await;
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.connect_and_join(generation).await {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => {
                    self.teardown().await;
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    self.signaling.disconnect();
                    last_error = e;
                }
            }
        }

        error!("Giving up on the relay after {} attempt(s)", backoff.attempts());
        self.publish();
        Err(last_error)
    }

    /// Leave the room and release everything; idempotent
    #[instrument(skip_all)]
    pub async fn leave(&mut self) {
        if !self.state.is_live() {
            debug!("Leave while {}, nothing to release", self.state);
            return;
        }

        info!("Leaving room");
        self.guard.advance();
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(mut peers) = self.peers.take() {
            peers.close_all().await;
        }
        self.roster = None;
        self.media.stop_all();
        self.signaling.disconnect();
        self.capture_mode = None;
        self.set_state(LifecycleState::Closed);
    }

    /// Mute or unmute the microphone; returns the new state
    ///
    /// # Errors
    ///
    /// `Error::Media` (NotFound) when there is no microphone track.
    pub fn toggle_mic(&mut self) -> Result<bool> {
        self.toggle(TrackKind::Audio)
    }

    /// Turn the camera on or off; returns the new state
    ///
    /// # Errors
    ///
    /// `Error::Media` (NotFound) when there is no camera track.
    pub fn toggle_video(&mut self) -> Result<bool> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool> {
        let track = self.media.track(kind).ok_or_else(|| {
            MediaError::new(MediaErrorKind::NotFound, format!("No local {} track", kind))
        })?;

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        info!("Local {} {}", kind, if enabled { "on" } else { "off" });

        self.emit_local_media();
        self.publish();
        Ok(enabled)
    }

    /// Switch a capture device, keeping every peer connection
    ///
    /// A failed camera switch turns local video off and raises the banner;
    /// the previous selection stays.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` outside a live session: capture is only ever
    /// acquired by `join` and released by `leave`.
    pub async fn change_input(&mut self, kind: TrackKind, device_id: &str) -> Result<()> {
        if !self.state.is_live() {
            return Err(Error::InvalidState {
                operation: "change_input",
                state: self.state.to_string(),
            });
        }

        let switched = self
            .media
            .change_input(kind, device_id, self.peers.as_mut())
            .await;

        match switched {
            Ok(_) => {
                self.media_banner = None;
                self.emit(SessionEvent::DeviceChanged {
                    kind: Some(kind),
                    device_id: device_id.to_string(),
                });
                self.publish();
                Ok(())
            }
            Err(e) => {
                if kind == TrackKind::Video {
                    if let Some(track) = self.media.track(TrackKind::Video) {
                        track.set_enabled(false);
                    }
                    self.emit_local_media();
                }
                self.raise_media_error(&e);
                self.publish();
                Err(e.into())
            }
        }
    }

    /// Route audio of every rendering surface to an output device
    pub fn change_output(&mut self, device_id: &str) -> Result<()> {
        match self.media.change_output(device_id) {
            Ok(()) => {
                self.emit(SessionEvent::DeviceChanged {
                    kind: None,
                    device_id: device_id.to_string(),
                });
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.raise_media_error(&e);
                self.publish();
                Err(e.into())
            }
        }
    }

    /// Register a rendering surface; it inherits the output selection
    pub fn attach_surface(&mut self, surface: Arc<dyn RenderSurface>) -> Result<()> {
        self.media.attach_surface(surface).map_err(Error::from)
    }

    /// Forget a rendering surface
    pub fn detach_surface(&mut self, id: &str) {
        self.media.detach_surface(id);
    }

    /// Physical devices per category
    pub async fn enumerate_devices(&self) -> Result<DeviceList> {
        self.media.enumerate_devices().await.map_err(Error::from)
    }

    /// Send a chat line; blank text is ignored
    ///
    /// The line is added to the local history right away.
    pub fn send_chat(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let (room, local_id) = match (&self.room, &self.roster) {
            (Some(room), Some(roster)) if self.state == LifecycleState::Active => {
                (room.to_string(), roster.local_id().to_string())
            }
            _ => {
                return Err(Error::InvalidState {
                    operation: "send chat",
                    state: self.state.to_string(),
                })
            }
        };

        let entry = ChatEntry {
            sender_id: local_id,
            sender_name: self.identity.name.clone(),
            text: text.to_string(),
            time: Utc::now(),
            is_local: true,
        };
        push_chat(&mut self.chat, entry.clone(), self.config.chat_history_limit);
        self.emit(SessionEvent::Chat(entry));
        self.publish();

        self.signaling
            .send(SignalingMessage::UserMessage(UserMessagePayload {
                room_id: room,
                text: text.to_string(),
                sender_name: self.identity.name.clone(),
            }))
    }

    /// Ask the relay to remove a participant
    ///
    /// # Errors
    ///
    /// * `Error::NotModerator` - local participant does not moderate
    /// * `Error::PeerNotFound` - target is not in the room
    pub fn kick(&mut self, target: &str) -> Result<()> {
        let roster = self.roster.as_ref().ok_or_else(|| Error::InvalidState {
            operation: "kick",
            state: self.state.to_string(),
        })?;

        let payload = roster.kick(target)?;
        info!("Asking relay to remove {}", target);
        self.signaling.send(SignalingMessage::Kick(payload))
    }

    /// Wait for the next relay message, link event or cancellation
    pub async fn next_input(&mut self) -> SessionInput {
        let token = self.generation.token().clone();
        let live = self.state.is_live();

        tokio::select! {
            _ = token.cancelled(), if live => SessionInput::Cancelled,
            event = self.signaling.recv() => SessionInput::Signal(event),
            Some(event) = self.peer_rx.recv() => SessionInput::Peer(event),
        }
    }

    /// Apply one input
    pub async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Signal(SignalingEvent::Message(message)) => {
                self.handle_signal(message).await
            }
            SessionInput::Signal(SignalingEvent::Disconnected) => self.on_relay_lost().await,
            SessionInput::Peer(event) => {
                if let Some(peers) = self.peers.as_mut() {
                    peers.on_link_event(event).await;
                }
                self.drain_peer_changes();
            }
            SessionInput::Cancelled => {
                info!("Session cancelled, tearing down");
                self.teardown().await;
            }
        }
        self.publish();
    }

    /// Apply every input that is already waiting; returns how many
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let input = if self.state.is_live() && self.generation.is_cancelled() {
                SessionInput::Cancelled
            } else if let Some(event) = self.signaling.try_recv() {
                SessionInput::Signal(event)
            } else if let Ok(event) = self.peer_rx.try_recv() {
                SessionInput::Peer(event)
            } else {
                break;
            };
            self.handle_input(input).await;
            handled += 1;
        }
        handled
    }

    /// Drive the session until it closes
    pub async fn run(&mut self) {
        while self.state != LifecycleState::Closed {
            let input = self.next_input().await;
            self.handle_input(input).await;
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        let tracks = self.media.tracks();
        let (Some(roster), Some(peers)) = (self.roster.as_mut(), self.peers.as_mut()) else {
            debug!(
                "Ignoring {} outside a room",
                message.event_name(Direction::FromRelay)
            );
            return;
        };

        let mut events = Vec::new();
        let mut kicked = false;

        match message {
            SignalingMessage::ExistingParticipants(list) => {
                debug!("{} participant(s) already in the room", list.len());
                let outcome = roster.on_existing_participants(list);
                events.extend(
                    outcome
                        .joined
                        .into_iter()
                        .map(SessionEvent::ParticipantJoined),
                );
                if outcome.self_elected {
                    peers.set_local_info(roster.local_user_info());
                    events.push(SessionEvent::BecameModerator);
                }
            }
            SignalingMessage::PeerJoined(p) => {
                if let Some(new) = roster.upsert(&p.socket_id, p.user_info) {
                    events.push(SessionEvent::ParticipantJoined(new));
                }
                peers.on_peer_joined(&p.socket_id, &tracks).await;
            }
            SignalingMessage::Offer(p) => {
                if let Some(info) = p.user_info.clone() {
                    if let Some(new) = roster.upsert(&p.from, info) {
                        events.push(SessionEvent::ParticipantJoined(new));
                    }
                }
                peers.on_offer(p, &tracks).await;
            }
            SignalingMessage::Answer(p) => {
                if let Some(info) = p.user_info.clone() {
                    if let Some(new) = roster.upsert(&p.from, info) {
                        events.push(SessionEvent::ParticipantJoined(new));
                    }
                }
                peers.on_answer(p).await;
            }
            SignalingMessage::IceCandidate(p) => peers.on_ice_candidate(p).await,
            SignalingMessage::PeerLeft(p) => {
                info!("{} left ({})", p.socket_id, p.reason);
                let removed = roster.remove(&p.socket_id);
                peers.on_peer_left(&p.socket_id).await;
                if let Some(removed) = removed {
                    events.push(SessionEvent::ParticipantLeft {
                        peer_id: p.socket_id,
                        name: Some(removed.name),
                        reason: p.reason,
                    });
                }
            }
            SignalingMessage::ModeratorChanged(p) => {
                let transition = roster.on_moderator_changed(&p);
                peers.set_local_info(roster.local_user_info());
                events.push(SessionEvent::ModeratorChanged {
                    peer_id: p.new_moderator_id,
                    name: p.new_moderator_name,
                });
                if transition == ModeratorTransition::Gained {
                    events.push(SessionEvent::BecameModerator);
                }
            }
            SignalingMessage::Kicked(p) => {
                warn!("Removed from the room by {}", p.kicked_by);
                events.push(SessionEvent::Kicked {
                    message: p.message,
                    kicked_by: p.kicked_by,
                });
                kicked = true;
            }
            SignalingMessage::ChatMessage(p) => {
                if p.user_id == roster.local_id() {
                    debug!("Own chat line echoed back, already shown");
                } else {
                    let time = DateTime::parse_from_rfc3339(&p.time)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                    let entry = ChatEntry {
                        sender_id: p.user_id,
                        sender_name: p.sender_name,
                        text: p.text,
                        time,
                        is_local: false,
                    };
                    push_chat(&mut self.chat, entry.clone(), self.config.chat_history_limit);
                    events.push(SessionEvent::Chat(entry));
                }
            }
            other @ (SignalingMessage::JoinRoom(_)
            | SignalingMessage::Kick(_)
            | SignalingMessage::UserMessage(_)) => {
                debug!(
                    "Ignoring relay-bound {} received from relay",
                    other.event_name(Direction::ToRelay)
                );
            }
        }

        for event in events {
            self.emit(event);
        }
        self.drain_peer_changes();

        if kicked {
            self.leave().await;
        }
    }

    async fn on_relay_lost(&mut self) {
        if self.state != LifecycleState::Active {
            debug!("Relay connection closed while {}", self.state);
            return;
        }

        warn!("Relay connection lost");
        self.set_state(LifecycleState::SignalingError);

        if let Some(mut peers) = self.peers.take() {
            peers.close_all().await;
        }
        if let Some(roster) = self.roster.take() {
            for p in roster.snapshot().iter().filter(|p| !p.is_local) {
                self.emit(SessionEvent::ParticipantLeft {
                    peer_id: p.peer_id.clone(),
                    name: Some(p.name.clone()),
                    reason: "disconnect".to_string(),
                });
            }
        }
        self.publish();

        let generation = self.generation.clone();
        if let Err(e) = self.reconnect(&generation).await {
            warn!("Session stays offline: {}", e);
        }
    }

    fn drain_peer_changes(&mut self) {
        let Some(peers) = self.peers.as_mut() else {
            return;
        };

        for change in peers.take_changes() {
            match change {
                PeerChange::Added { peer_id, role } => {
                    debug!("Connection to {} created as {:?}", peer_id, role)
                }
                PeerChange::Connected { peer_id } => {
                    let _ = self.events_tx.send(SessionEvent::PeerConnected(peer_id));
                }
                PeerChange::Removed { peer_id, reason } => {
                    let _ = self
                        .events_tx
                        .send(SessionEvent::PeerRemoved { peer_id, reason });
                }
            }
        }
    }

    fn raise_media_error(&mut self, error: &MediaError) {
        warn!("Media error: {}", error);
        let message = error.user_message();
        self.media_banner = Some(message.clone());
        self.emit(SessionEvent::MediaError {
            kind: error.kind,
            message,
        });
    }

    fn emit_local_media(&self) {
        let enabled = |kind| {
            self.media
                .track(kind)
                .map(|t| t.is_enabled())
                .unwrap_or(false)
        };
        self.emit(SessionEvent::LocalMediaChanged {
            audio: enabled(TrackKind::Audio),
            video: enabled(TrackKind::Video),
        });
    }

    fn set_state(&mut self, to: LifecycleState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        info!("Session {} -> {}", from, to);
        self.emit(SessionEvent::StateChanged { from, to });
        self.publish();
    }

    fn emit(&self, event: SessionEvent) {
        // A dropped receiver means nobody is listening
        let _ = self.events_tx.send(event);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

fn push_chat(chat: &mut Arc<Vec<ChatEntry>>, entry: ChatEntry, limit: usize) {
    let history = Arc::make_mut(chat);
    history.push(entry);
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if !self.state.is_live() {
            return;
        }

        debug!("Session dropped while {}, releasing resources", self.state);
        self.guard.advance();
        self.media.stop_all();
        self.signaling.disconnect();

        if let Some(mut peers) = self.peers.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { peers.close_all().await });
                }
                Err(_) => warn!("No runtime to close {} peer connection(s)", peers.len()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticBackend;
    use crate::peer::LoopbackNetwork;
    use crate::signaling::{MemoryRelay, ReconnectionPolicy};

    fn controller(relay: &MemoryRelay) -> SessionController {
        let config = MeshConfig::default().with_reconnect(ReconnectionPolicy::immediate(2));
        SessionController::new(
            config,
            Arc::new(relay.clone()),
            Arc::new(LoopbackNetwork::new()),
            Arc::new(SyntheticBackend::with_default_devices()),
        )
        .unwrap()
    }

    fn entry(text: &str) -> ChatEntry {
        ChatEntry {
            sender_id: "p".to_string(),
            sender_name: "P".to_string(),
            text: text.to_string(),
            time: Utc::now(),
            is_local: false,
        }
    }

    #[test]
    fn test_chat_history_capped() {
        let mut chat = Arc::new(Vec::new());
        for i in 0..5 {
            push_chat(&mut chat, entry(&i.to_string()), 3);
        }
        let texts: Vec<_> = chat.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_malformed_code_never_connects() {
        let relay = MemoryRelay::new();
        let mut session = controller(&relay);
        let mut events = session.take_events().unwrap();

        let result = session.join("ABC123", Identity::new("Alice", "a@x.io")).await;

        assert!(matches!(result, Err(Error::InvalidRoomCode(_))));
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(session.state(), LifecycleState::Idle);
        match events.try_recv().unwrap() {
            SessionEvent::InvalidRoomCode { code, redirect_in } => {
                assert_eq!(code, "ABC123");
                assert_eq!(redirect_in, std::time::Duration::from_secs(30));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_device_switch_before_join_is_refused() {
        let relay = MemoryRelay::new();
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let mut session = SessionController::new(
            MeshConfig::default(),
            Arc::new(relay.clone()),
            Arc::new(LoopbackNetwork::new()),
            backend.clone(),
        )
        .unwrap();

        let result = session.change_input(TrackKind::Video, "cam-usb").await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        assert_eq!(backend.acquire_calls(), 0);

        session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.capture_mode, Some(CaptureMode::AudioVideo));
        assert!(session.media().track(TrackKind::Audio).is_some());
        assert!(session.media().track(TrackKind::Video).is_some());
    }

    #[tokio::test]
    async fn test_device_switch_after_leave_acquires_nothing() {
        let relay = MemoryRelay::new();
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        let mut session = SessionController::new(
            MeshConfig::default(),
            Arc::new(relay.clone()),
            Arc::new(LoopbackNetwork::new()),
            backend.clone(),
        )
        .unwrap();

        session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();
        session.leave().await;
        let calls = backend.acquire_calls();

        let result = session.change_input(TrackKind::Video, "cam-usb").await;
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        assert_eq!(backend.acquire_calls(), calls);

        drop(session);
        assert!(backend.issued_tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_join_walks_lifecycle() {
        let relay = MemoryRelay::new();
        let mut session = controller(&relay);
        let mut events = session.take_events().unwrap();

        session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                LifecycleState::Initializing,
                LifecycleState::Joining,
                LifecycleState::Active
            ]
        );
        assert_eq!(session.subscribe().borrow().state, LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_join_twice_rejected() {
        let relay = MemoryRelay::new();
        let mut session = controller(&relay);
        session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();

        let again = session.join("abc-1234-xyz", Identity::default()).await;
        assert!(matches!(again, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_relay_gives_up_after_retries() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);
        let mut session = controller(&relay);
        let mut events = session.take_events().unwrap();

        let result = session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await;

        assert!(matches!(result, Err(Error::SignalingError(_))));
        assert_eq!(session.state(), LifecycleState::SignalingError);

        let attempts = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SessionEvent::Reconnecting { .. }))
            .count();
        assert_eq!(attempts, 2);

        // Local tracks are kept until leave
        assert!(!session.media().tracks().is_empty());
        session.leave().await;
        assert_eq!(session.state(), LifecycleState::Closed);
        assert!(session.media().tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_toggle_mic_flips_enabled() {
        let relay = MemoryRelay::new();
        let mut session = controller(&relay);
        session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();

        assert!(!session.toggle_mic().unwrap());
        assert!(!session.snapshot().audio_enabled);
        assert!(session.toggle_mic().unwrap());
        assert!(session.snapshot().audio_enabled);
    }

    #[tokio::test]
    async fn test_blank_chat_ignored() {
        let relay = MemoryRelay::new();
        let mut session = controller(&relay);
        session
            .join("abc-1234-xyz", Identity::new("Alice", "a@x.io"))
            .await
            .unwrap();

        session.send_chat("   ").unwrap();
        assert!(session.snapshot().chat.is_empty());

        session.send_chat(" hi ").unwrap();
        let chat = session.snapshot().chat;
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].text, "hi");
        assert!(chat[0].is_local);
    }
}
