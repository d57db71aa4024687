//! Per-peer connection records and the negotiation state machine
//!
//! Roles are derived from which event arrives first: a member already in the
//! room sees `peer-joined` and offers; the newcomer only ever receives an
//! offer and answers. At most one record exists per peer id.
//!
//! The registry is owned by the session loop and mutated only from there.
//! Failures with one peer (bad SDP, ICE failure) remove that peer's record
//! and are logged; they never surface as errors to the caller.

use super::link::{
    LinkContext, LinkState, PeerEvent, PeerEventKind, PeerLink, PeerLinkFactory, RemoteTrackInfo,
};
use crate::config::MeshConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::protocol::{IceCandidatePayload, SdpPayload};
use crate::signaling::{
    IceCandidate, PeerId, SessionDescription, SignalSender, SignalingMessage, UserInfo,
};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which side of the pair creates the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationRole {
    /// Already in the room when the other side arrived
    Offerer,
    /// Arrived after the other side
    Answerer,
}

/// Sub-state while negotiating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationPhase {
    /// Offer sent, waiting for the answer
    Offering,
    /// Offer received, answer being produced
    Answering,
}

/// Lifecycle of one peer record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Record exists, nothing exchanged
    New,
    /// Offer/answer in progress
    Negotiating(NegotiationPhase),
    /// Media flowing
    Connected,
    /// Connectivity lost
    Disconnected,
    /// ICE failed
    Failed,
    /// Torn down
    Closed,
}

impl ConnectionState {
    /// Whether local tracks should follow device changes on this record
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::New | ConnectionState::Negotiating(_) | ConnectionState::Connected
        )
    }
}

/// Why a record went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalReason {
    /// The peer left the room
    Left,
    /// ICE failed
    Failed,
    /// Connectivity lost
    Disconnected,
    /// The link closed on its own
    Closed,
    /// SDP could not be produced or applied
    NegotiationFailed,
}

/// Something the session should tell the view about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    /// A record was created
    Added {
        /// Remote peer
        peer_id: PeerId,
        /// Our role towards it
        role: NegotiationRole,
    },
    /// A record reached Connected
    Connected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// A record was removed
    Removed {
        /// Remote peer
        peer_id: PeerId,
        /// Why
        reason: RemovalReason,
    },
}

/// Read-only view of one record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    /// Remote peer
    pub peer_id: PeerId,
    /// Connection instance; changes only if the record is recreated
    pub connection_id: Uuid,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Our role
    pub role: NegotiationRole,
    /// Remote media received so far
    pub remote_tracks: Vec<RemoteTrackInfo>,
    /// Remote candidates waiting for the remote description
    pub pending_candidates: usize,
}

/// Outcome of pushing a replacement track to every active record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    /// Records now carrying the new track
    pub replaced: usize,
    /// Records that could not take it
    pub failed: usize,
}

struct PeerRecord {
    connection_id: Uuid,
    state: ConnectionState,
    role: NegotiationRole,
    remote_applied: bool,
    pending: Vec<IceCandidate>,
    remote_tracks: Vec<RemoteTrackInfo>,
    link: Arc<dyn PeerLink>,
}

/// Owner of every peer connection in the mesh
pub struct PeerRegistry {
    local_id: PeerId,
    local_info: UserInfo,
    factory: Arc<dyn PeerLinkFactory>,
    signals: SignalSender,
    events: mpsc::UnboundedSender<PeerEvent>,
    records: HashMap<PeerId, PeerRecord>,
    /// Candidates from peers we have no record for yet, at most `max_peers` ids
    orphans: HashMap<PeerId, Vec<IceCandidate>>,
    max_peers: usize,
    max_pending: usize,
    changes: Vec<PeerChange>,
    snapshot: Arc<Vec<PeerSummary>>,
}

impl PeerRegistry {
    /// Create an empty registry for one relay connection
    ///
    /// # Arguments
    ///
    /// * `local_id` - Relay-assigned id of this participant
    /// * `local_info` - Identity attached to outgoing offers and answers
    /// * `factory` - Builds the transport for each peer
    /// * `signals` - Outbound half of the relay connection
    /// * `events` - Where links report state, candidates and tracks
    /// * `config` - Peer cap and candidate buffer size
    pub fn new(
        local_id: PeerId,
        local_info: UserInfo,
        factory: Arc<dyn PeerLinkFactory>,
        signals: SignalSender,
        events: mpsc::UnboundedSender<PeerEvent>,
        config: &MeshConfig,
    ) -> Self {
        Self {
            local_id,
            local_info,
            factory,
            signals,
            events,
            records: HashMap::new(),
            orphans: HashMap::new(),
            max_peers: config.max_peers,
            max_pending: config.max_pending_candidates,
            changes: Vec::new(),
            snapshot: Arc::new(Vec::new()),
        }
    }

    /// Local participant id
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Update the identity attached to future offers and answers
    pub fn set_local_info(&mut self, info: UserInfo) {
        self.local_info = info;
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a record exists for the peer
    pub fn contains(&self, peer_id: &str) -> bool {
        self.records.contains_key(peer_id)
    }

    /// State of a peer's record
    pub fn state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.records.get(peer_id).map(|r| r.state)
    }

    /// Our role towards a peer
    pub fn role(&self, peer_id: &str) -> Option<NegotiationRole> {
        self.records.get(peer_id).map(|r| r.role)
    }

    /// Connection instance id of a peer's record
    pub fn connection_id(&self, peer_id: &str) -> Option<Uuid> {
        self.records.get(peer_id).map(|r| r.connection_id)
    }

    /// Remote candidates buffered for a peer, with or without a record
    pub fn pending_candidates(&self, peer_id: &str) -> usize {
        match self.records.get(peer_id) {
            Some(record) => record.pending.len(),
            None => self.orphans.get(peer_id).map(Vec::len).unwrap_or(0),
        }
    }

    /// Copy-on-write snapshot, sorted by peer id
    pub fn snapshot(&self) -> Arc<Vec<PeerSummary>> {
        Arc::clone(&self.snapshot)
    }

    /// Drain changes accumulated since the last call
    pub fn take_changes(&mut self) -> Vec<PeerChange> {
        std::mem::take(&mut self.changes)
    }

    /// A participant entered the room: we are the offerer
    pub async fn on_peer_joined(&mut self, peer_id: &str, tracks: &[LocalTrack]) {
        if peer_id == self.local_id {
            return;
        }
        if self.records.contains_key(peer_id) {
            debug!("Duplicate peer-joined for {}, keeping existing record", peer_id);
            return;
        }

        if let Err(e) = self.open_record(peer_id, NegotiationRole::Offerer, tracks).await {
            warn!("Not connecting to {}: {}", peer_id, e);
            return;
        }

        if let Err(e) = self.send_offer(peer_id).await {
            self.fail_negotiation(peer_id, e).await;
        }
        self.refresh();
    }

    /// An offer arrived: answer it, creating the record if needed
    pub async fn on_offer(&mut self, payload: SdpPayload, tracks: &[LocalTrack]) {
        let peer_id = payload.from;
        if peer_id == self.local_id {
            return;
        }

        match self.records.get(&peer_id) {
            Some(record) if record.role == NegotiationRole::Offerer && !record.remote_applied => {
                warn!(
                    "Offer from {} while our own offer is outstanding, discarding",
                    peer_id
                );
                return;
            }
            Some(_) => debug!("Renegotiation offer from {}", peer_id),
            None => {
                if let Err(e) = self
                    .open_record(&peer_id, NegotiationRole::Answerer, tracks)
                    .await
                {
                    warn!("Not answering {}: {}", peer_id, e);
                    return;
                }
            }
        }

        if let Err(e) = self.send_answer(&peer_id, payload.payload).await {
            self.fail_negotiation(&peer_id, e).await;
        }
        self.refresh();
    }

    /// An answer arrived for an offer we made
    pub async fn on_answer(&mut self, payload: SdpPayload) {
        let peer_id = payload.from;

        let Some(record) = self.records.get(&peer_id) else {
            debug!("Stale answer from {} (no record), discarding", peer_id);
            return;
        };
        if record.role != NegotiationRole::Offerer || record.remote_applied {
            debug!("Unexpected answer from {}, discarding", peer_id);
            return;
        }

        let link = Arc::clone(&record.link);
        match link.set_remote_description(payload.payload).await {
            Ok(()) => {
                if let Some(record) = self.records.get_mut(&peer_id) {
                    record.remote_applied = true;
                }
                self.drain_pending(&peer_id).await;
            }
            Err(e) => self.fail_negotiation(&peer_id, e).await,
        }
        self.refresh();
    }

    /// A remote candidate arrived; apply it or hold it until it can be
    pub async fn on_ice_candidate(&mut self, payload: IceCandidatePayload) {
        let peer_id = payload.from;
        let Some(candidate) = payload.candidate else {
            debug!("End of candidates from {}", peer_id);
            return;
        };

        let max = self.max_pending;
        match self.records.get_mut(&peer_id) {
            Some(record) if record.remote_applied => {
                let link = Arc::clone(&record.link);
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    warn!("Candidate from {} rejected: {}", peer_id, e);
                }
            }
            Some(record) => {
                debug!("Buffering candidate from {} until remote description", peer_id);
                push_capped(&mut record.pending, candidate, max, &peer_id);
            }
            None => {
                if !self.orphans.contains_key(&peer_id) && self.orphans.len() >= self.max_peers {
                    warn!(
                        "Candidates from {} unknown peers already held, dropping one from {}",
                        self.orphans.len(),
                        peer_id
                    );
                    return;
                }
                debug!("Buffering candidate from {} before first sighting", peer_id);
                let buffer = self.orphans.entry(peer_id.clone()).or_default();
                push_capped(buffer, candidate, max, &peer_id);
            }
        }
        self.refresh();
    }

    /// A link reported something
    pub async fn on_link_event(&mut self, event: PeerEvent) {
        let peer_id = event.peer_id;
        let Some(record) = self.records.get_mut(&peer_id) else {
            debug!("Event for unknown peer {}, discarding", peer_id);
            return;
        };
        if record.connection_id != event.connection_id {
            debug!("Event from replaced connection to {}, discarding", peer_id);
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let msg = SignalingMessage::IceCandidate(IceCandidatePayload {
                    from: self.local_id.clone(),
                    to: Some(peer_id.clone()),
                    candidate: Some(candidate),
                });
                if let Err(e) = self.signals.send(msg) {
                    warn!("Could not trickle candidate to {}: {}", peer_id, e);
                }
            }
            PeerEventKind::StateChanged(LinkState::Connected) => {
                if record.state != ConnectionState::Connected {
                    info!("Peer {} connected", peer_id);
                    record.state = ConnectionState::Connected;
                    self.changes.push(PeerChange::Connected { peer_id });
                }
            }
            PeerEventKind::StateChanged(LinkState::Failed) => {
                self.remove_record(&peer_id, RemovalReason::Failed).await;
            }
            PeerEventKind::StateChanged(LinkState::Disconnected) => {
                self.remove_record(&peer_id, RemovalReason::Disconnected).await;
            }
            PeerEventKind::StateChanged(LinkState::Closed) => {
                self.remove_record(&peer_id, RemovalReason::Closed).await;
            }
            PeerEventKind::StateChanged(LinkState::New | LinkState::Connecting) => {}
            PeerEventKind::RemoteTrack(info) => {
                debug!("Remote {} track from {}", info.kind, peer_id);
                record.remote_tracks.push(info);
            }
        }
        self.refresh();
    }

    /// A participant left the room
    pub async fn on_peer_left(&mut self, peer_id: &str) {
        self.remove_record(peer_id, RemovalReason::Left).await;
        self.refresh();
    }

    /// Swap the local track of `kind` on every active record
    ///
    /// Uses each record's existing sender; no offer is created.
    pub async fn replace_track(&mut self, kind: TrackKind, track: &LocalTrack) -> ReplaceStats {
        let mut stats = ReplaceStats::default();

        for (peer_id, record) in &self.records {
            if !record.state.is_active() {
                continue;
            }
            match record.link.replace_track(kind, track).await {
                Ok(()) => stats.replaced += 1,
                Err(e) => {
                    warn!("Could not replace {} track for {}: {}", kind, peer_id, e);
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    /// Close every record
    pub async fn close_all(&mut self) {
        let count = self.records.len();
        for (peer_id, record) in self.records.drain() {
            if let Err(e) = record.link.close().await {
                warn!("Error closing connection to {}: {}", peer_id, e);
            }
        }
        self.orphans.clear();
        self.refresh();

        if count > 0 {
            info!("Closed {} peer connection(s)", count);
        }
    }

    async fn open_record(
        &mut self,
        peer_id: &str,
        role: NegotiationRole,
        tracks: &[LocalTrack],
    ) -> Result<()> {
        if self.records.len() >= self.max_peers {
            return Err(Error::PeerLimitReached(self.max_peers));
        }

        let connection_id = Uuid::new_v4();
        let link = self
            .factory
            .create(LinkContext {
                local_id: self.local_id.clone(),
                peer_id: peer_id.to_string(),
                connection_id,
                events: self.events.clone(),
            })
            .await?;

        for track in tracks {
            if let Err(e) = link.add_track(track).await {
                warn!("Could not attach {} track for {}: {}", track.kind(), peer_id, e);
            }
        }

        info!("New connection to {} as {:?}", peer_id, role);

        self.records.insert(
            peer_id.to_string(),
            PeerRecord {
                connection_id,
                state: ConnectionState::New,
                role,
                remote_applied: false,
                pending: self.orphans.remove(peer_id).unwrap_or_default(),
                remote_tracks: Vec::new(),
                link,
            },
        );
        self.changes.push(PeerChange::Added {
            peer_id: peer_id.to_string(),
            role,
        });

        Ok(())
    }

    fn link(&self, peer_id: &str) -> Result<Arc<dyn PeerLink>> {
        self.records
            .get(peer_id)
            .map(|r| Arc::clone(&r.link))
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    /// Move a fresh record into negotiation; later renegotiations keep their state
    fn begin_negotiation(&mut self, peer_id: &str, phase: NegotiationPhase) {
        if let Some(record) = self.records.get_mut(peer_id) {
            if record.state == ConnectionState::New {
                record.state = ConnectionState::Negotiating(phase);
            }
        }
    }

    async fn send_offer(&mut self, peer_id: &str) -> Result<()> {
        self.begin_negotiation(peer_id, NegotiationPhase::Offering);
        let offer = self.link(peer_id)?.create_offer().await?;

        self.signals.send(SignalingMessage::Offer(SdpPayload {
            from: self.local_id.clone(),
            to: Some(peer_id.to_string()),
            payload: offer,
            user_info: Some(self.local_info.clone()),
        }))
    }

    async fn send_answer(&mut self, peer_id: &str, offer: SessionDescription) -> Result<()> {
        self.begin_negotiation(peer_id, NegotiationPhase::Answering);
        let link = self.link(peer_id)?;
        link.set_remote_description(offer).await?;

        if let Some(record) = self.records.get_mut(peer_id) {
            record.remote_applied = true;
        }
        self.drain_pending(peer_id).await;

        let answer = link.create_answer().await?;
        self.signals.send(SignalingMessage::Answer(SdpPayload {
            from: self.local_id.clone(),
            to: Some(peer_id.to_string()),
            payload: answer,
            user_info: Some(self.local_info.clone()),
        }))
    }

    async fn drain_pending(&mut self, peer_id: &str) {
        let Some(record) = self.records.get_mut(peer_id) else {
            return;
        };
        let pending = std::mem::take(&mut record.pending);
        if pending.is_empty() {
            return;
        }

        debug!("Applying {} buffered candidate(s) from {}", pending.len(), peer_id);
        let link = Arc::clone(&record.link);
        for candidate in pending {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!("Buffered candidate from {} rejected: {}", peer_id, e);
            }
        }
    }

    async fn fail_negotiation(&mut self, peer_id: &str, error: Error) {
        warn!("Negotiation with {} failed: {}", peer_id, error);
        self.remove_record(peer_id, RemovalReason::NegotiationFailed)
            .await;
    }

    async fn remove_record(&mut self, peer_id: &str, reason: RemovalReason) {
        self.orphans.remove(peer_id);
        let Some(record) = self.records.remove(peer_id) else {
            return;
        };

        info!("Removing connection to {} ({:?})", peer_id, reason);
        if let Err(e) = record.link.close().await {
            warn!("Error closing connection to {}: {}", peer_id, e);
        }
        self.changes.push(PeerChange::Removed {
            peer_id: peer_id.to_string(),
            reason,
        });
    }

    fn refresh(&mut self) {
        let mut summaries: Vec<PeerSummary> = self
            .records
            .iter()
            .map(|(peer_id, r)| PeerSummary {
                peer_id: peer_id.clone(),
                connection_id: r.connection_id,
                state: r.state,
                role: r.role,
                remote_tracks: r.remote_tracks.clone(),
                pending_candidates: r.pending.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        self.snapshot = Arc::new(summaries);
    }
}

fn push_capped(buffer: &mut Vec<IceCandidate>, candidate: IceCandidate, max: usize, peer_id: &str) {
    if buffer.len() >= max {
        warn!("Candidate buffer for {} full, dropping oldest", peer_id);
        buffer.remove(0);
    }
    buffer.push(candidate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LoopbackNetwork;

    struct Side {
        registry: PeerRegistry,
        signals: mpsc::UnboundedReceiver<SignalingMessage>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn side(id: &str, net: &LoopbackNetwork, config: &MeshConfig) -> Side {
        let (sig_tx, signals) = mpsc::unbounded_channel();
        let (ev_tx, events) = mpsc::unbounded_channel();
        let info = UserInfo {
            name: id.to_uppercase(),
            ..Default::default()
        };
        Side {
            registry: PeerRegistry::new(
                id.to_string(),
                info,
                Arc::new(net.clone()),
                SignalSender::new(sig_tx),
                ev_tx,
                config,
            ),
            signals,
            events,
        }
    }

    fn outbound(side: &mut Side) -> Vec<SignalingMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = side.signals.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn deliver(target: &mut Side, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Offer(p) => target.registry.on_offer(p, &[]).await,
            SignalingMessage::Answer(p) => target.registry.on_answer(p).await,
            SignalingMessage::IceCandidate(p) => target.registry.on_ice_candidate(p).await,
            other => panic!("unexpected outbound {:?}", other),
        }
    }

    async fn pump_events(side: &mut Side) {
        while let Ok(ev) = side.events.try_recv() {
            side.registry.on_link_event(ev).await;
        }
    }

    /// Route everything between two sides until quiet
    async fn settle(a: &mut Side, b: &mut Side) {
        for _ in 0..10 {
            pump_events(a).await;
            pump_events(b).await;
            let from_a = outbound(a);
            let from_b = outbound(b);
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for msg in from_a {
                deliver(b, msg).await;
            }
            for msg in from_b {
                deliver(a, msg).await;
            }
        }
    }

    fn candidate(from: &str, to: &str) -> IceCandidatePayload {
        IceCandidatePayload {
            from: from.to_string(),
            to: Some(to.to_string()),
            candidate: Some(IceCandidate {
                candidate: "candidate:9 1 udp 2122260223 10.0.0.9 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_existing_member_offers_newcomer_answers() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        assert_eq!(a.registry.role("b"), Some(NegotiationRole::Offerer));

        settle(&mut a, &mut b).await;

        assert_eq!(b.registry.role("a"), Some(NegotiationRole::Answerer));
        assert_eq!(a.registry.state("b"), Some(ConnectionState::Connected));
        assert_eq!(b.registry.state("a"), Some(ConnectionState::Connected));
        assert_eq!(net.offers_created("a", "b"), 1);
        assert_eq!(net.offers_created("b", "a"), 0);
        assert!(net.applied_candidates("b", "a") >= 1);
        assert!(net.applied_candidates("a", "b") >= 1);

        let changes = a.registry.take_changes();
        assert!(changes.contains(&PeerChange::Connected {
            peer_id: "b".to_string()
        }));
    }

    #[tokio::test]
    async fn test_duplicate_peer_joined_keeps_one_record() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        let first = a.registry.connection_id("b");
        a.registry.on_peer_joined("b", &[]).await;
        a.registry.on_peer_joined("a", &[]).await;

        assert_eq!(a.registry.len(), 1);
        assert_eq!(a.registry.connection_id("b"), first);
        assert_eq!(net.offers_created("a", "b"), 1);
        assert_eq!(outbound(&mut a).len(), 1);
    }

    #[tokio::test]
    async fn test_late_peer_joined_after_offer_keeps_answerer() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        for msg in outbound(&mut a) {
            deliver(&mut b, msg).await;
        }
        let id = b.registry.connection_id("a");
        assert!(id.is_some());

        // Relay delivers b's peer-joined for a after a's offer
        b.registry.on_peer_joined("a", &[]).await;

        assert_eq!(b.registry.len(), 1);
        assert_eq!(b.registry.role("a"), Some(NegotiationRole::Answerer));
        assert_eq!(b.registry.connection_id("a"), id);
        assert_eq!(net.offers_created("b", "a"), 0);
        let replies = outbound(&mut b);
        assert!(replies.iter().all(|m| !matches!(m, SignalingMessage::Offer(_))));
        for msg in replies {
            deliver(&mut a, msg).await;
        }

        settle(&mut a, &mut b).await;
        assert_eq!(b.registry.state("a"), Some(ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_records_enter_negotiation_by_role() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        assert_eq!(
            a.registry.state("b"),
            Some(ConnectionState::Negotiating(NegotiationPhase::Offering))
        );

        let offer = outbound(&mut a)
            .into_iter()
            .find(|m| matches!(m, SignalingMessage::Offer(_)))
            .unwrap();
        deliver(&mut b, offer).await;
        assert_eq!(
            b.registry.state("a"),
            Some(ConnectionState::Negotiating(NegotiationPhase::Answering))
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_candidates_are_bounded() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default().with_max_peers(2);
        let mut b = side("b", &net, &config);

        b.registry.on_ice_candidate(candidate("x", "b")).await;
        b.registry.on_ice_candidate(candidate("y", "b")).await;
        b.registry.on_ice_candidate(candidate("z", "b")).await;
        b.registry.on_ice_candidate(candidate("x", "b")).await;

        assert_eq!(b.registry.pending_candidates("x"), 2);
        assert_eq!(b.registry.pending_candidates("y"), 1);
        assert_eq!(b.registry.pending_candidates("z"), 0);

        b.registry.on_peer_left("x").await;
        b.registry.on_ice_candidate(candidate("z", "b")).await;
        assert_eq!(b.registry.pending_candidates("x"), 0);
        assert_eq!(b.registry.pending_candidates("z"), 1);
    }

    #[tokio::test]
    async fn test_failed_record_leaves_no_buffered_candidates() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        settle(&mut a, &mut b).await;

        net.fail_link("a", "b");
        pump_events(&mut a).await;
        assert!(!a.registry.contains("b"));
        assert_eq!(a.registry.pending_candidates("b"), 0);

        // Trailing candidate after the failure is held until peer-left
        a.registry.on_ice_candidate(candidate("b", "a")).await;
        assert_eq!(a.registry.pending_candidates("b"), 1);
        a.registry.on_peer_left("b").await;
        assert_eq!(a.registry.pending_candidates("b"), 0);
    }

    #[tokio::test]
    async fn test_early_candidate_buffered_then_applied() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        // Candidate overtakes the offer
        b.registry.on_ice_candidate(candidate("a", "b")).await;
        assert_eq!(b.registry.pending_candidates("a"), 1);
        assert!(!b.registry.contains("a"));

        a.registry.on_peer_joined("b", &[]).await;
        let offer = outbound(&mut a)
            .into_iter()
            .find(|m| matches!(m, SignalingMessage::Offer(_)))
            .unwrap();
        deliver(&mut b, offer).await;

        assert_eq!(b.registry.pending_candidates("a"), 0);
        assert_eq!(net.applied_candidates("b", "a"), 1);
    }

    #[tokio::test]
    async fn test_candidate_before_answer_is_buffered_on_record() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        a.registry.on_ice_candidate(candidate("b", "a")).await;
        assert_eq!(a.registry.pending_candidates("b"), 1);
        assert_eq!(net.applied_candidates("a", "b"), 0);

        settle(&mut a, &mut b).await;
        assert_eq!(a.registry.pending_candidates("b"), 0);
        assert!(net.applied_candidates("a", "b") >= 2);
    }

    #[tokio::test]
    async fn test_stale_answer_discarded() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);

        a.registry
            .on_answer(SdpPayload {
                from: "ghost".to_string(),
                to: Some("a".to_string()),
                payload: SessionDescription::answer("v=0\r\n"),
                user_info: None,
            })
            .await;

        assert!(a.registry.is_empty());
        assert!(a.registry.take_changes().is_empty());
    }

    #[tokio::test]
    async fn test_offer_while_offering_is_discarded() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        outbound(&mut a);
        let id = a.registry.connection_id("b");

        a.registry
            .on_offer(
                SdpPayload {
                    from: "b".to_string(),
                    to: Some("a".to_string()),
                    payload: SessionDescription::offer("v=0\r\n"),
                    user_info: None,
                },
                &[],
            )
            .await;

        assert_eq!(a.registry.role("b"), Some(NegotiationRole::Offerer));
        assert_eq!(a.registry.connection_id("b"), id);
        assert!(outbound(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_offer_drops_record() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut b = side("b", &net, &config);

        b.registry
            .on_offer(
                SdpPayload {
                    from: "a".to_string(),
                    to: Some("b".to_string()),
                    payload: SessionDescription::offer("garbage"),
                    user_info: None,
                },
                &[],
            )
            .await;

        assert!(b.registry.is_empty());
        assert!(outbound(&mut b).is_empty());
        let changes = b.registry.take_changes();
        assert!(changes.contains(&PeerChange::Removed {
            peer_id: "a".to_string(),
            reason: RemovalReason::NegotiationFailed
        }));
    }

    #[tokio::test]
    async fn test_failure_removes_only_that_peer() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);
        let mut c = side("c", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        settle(&mut a, &mut b).await;
        a.registry.on_peer_joined("c", &[]).await;
        settle(&mut a, &mut c).await;
        assert_eq!(a.registry.len(), 2);

        net.fail_link("a", "b");
        pump_events(&mut a).await;

        assert!(!a.registry.contains("b"));
        assert_eq!(a.registry.state("c"), Some(ConnectionState::Connected));
        assert!(net.is_closed("a", "b"));
    }

    #[tokio::test]
    async fn test_event_from_replaced_connection_ignored() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        a.registry
            .on_link_event(PeerEvent {
                peer_id: "b".to_string(),
                connection_id: Uuid::new_v4(),
                kind: PeerEventKind::StateChanged(LinkState::Failed),
            })
            .await;

        assert!(a.registry.contains("b"));
    }

    #[tokio::test]
    async fn test_peer_cap() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default().with_max_peers(1);
        let mut a = side("a", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        a.registry.on_peer_joined("c", &[]).await;

        assert_eq!(a.registry.len(), 1);
        assert!(!a.registry.contains("c"));
    }

    #[tokio::test]
    async fn test_replace_track_keeps_records() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);
        let mut b = side("b", &net, &config);

        let cam = LocalTrack::new(TrackKind::Video, "cam-1", "Cam");
        a.registry.on_peer_joined("b", std::slice::from_ref(&cam)).await;
        settle(&mut a, &mut b).await;
        let id = a.registry.connection_id("b");

        let other = LocalTrack::new(TrackKind::Video, "cam-2", "Cam 2");
        let stats = a.registry.replace_track(TrackKind::Video, &other).await;

        assert_eq!(stats, ReplaceStats { replaced: 1, failed: 0 });
        assert_eq!(a.registry.connection_id("b"), id);
        assert_eq!(net.offers_created("a", "b"), 1);
        assert_eq!(
            net.sending_track("a", "b", TrackKind::Video).as_deref(),
            Some(other.id())
        );
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let net = LoopbackNetwork::new();
        let config = MeshConfig::default();
        let mut a = side("a", &net, &config);

        a.registry.on_peer_joined("b", &[]).await;
        a.registry.on_peer_joined("c", &[]).await;
        a.registry.close_all().await;

        assert!(a.registry.is_empty());
        assert!(a.registry.snapshot().is_empty());
        assert!(net.is_closed("a", "b") && net.is_closed("a", "c"));
    }
}
