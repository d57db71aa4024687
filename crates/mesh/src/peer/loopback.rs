//! In-process peer network
//!
//! Links created by one [`LoopbackNetwork`] find each other by
//! `(local_id, peer_id)`. A pair reports `Connected` as soon as both ends
//! hold a local and a remote description; candidates are accepted only after
//! the remote description, exactly like a real ICE agent. Counters expose
//! how many offers were made and which track each sender carries.

use super::link::{
    LinkContext, LinkState, PeerEventKind, PeerLink, PeerLinkFactory, RemoteTrackInfo,
};
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::protocol::SdpType;
use crate::signaling::{IceCandidate, PeerId, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type Key = (PeerId, PeerId);

struct Endpoint {
    ctx: LinkContext,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<(TrackKind, String)>,
    applied_candidates: Vec<IceCandidate>,
    offers: usize,
    replaced: usize,
    connected: bool,
    closed: bool,
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<Key, Endpoint>,
    seq: u64,
    total_offers: usize,
}

impl NetState {
    fn endpoint(&mut self, key: &Key, connection_id: Uuid) -> Result<&mut Endpoint> {
        match self.endpoints.get_mut(key) {
            Some(ep) if ep.ctx.connection_id == connection_id && !ep.closed => Ok(ep),
            _ => Err(Error::ConnectionLifecycle {
                peer_id: key.1.clone(),
                reason: "loopback link closed".to_string(),
            }),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn describe(&mut self, key: &Key, sdp_type: SdpType) -> SessionDescription {
        let seq = self.next_seq();
        let mut sdp = format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=loopback {}->{}\r\n",
            seq, key.0, key.1
        );
        if let Some(ep) = self.endpoints.get(key) {
            for (kind, id) in &ep.senders {
                sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:local {}\r\n", kind, id));
            }
        }
        SessionDescription { sdp_type, sdp }
    }

    fn host_candidate(&mut self) -> IceCandidate {
        let seq = self.next_seq();
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                seq,
                40000 + seq
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Report Connected on both ends once each holds both descriptions
    fn maybe_connect(&mut self, key: &Key) {
        let mirror = (key.1.clone(), key.0.clone());
        let ready = |ep: Option<&Endpoint>| {
            ep.map(|e| !e.closed && !e.connected && e.local.is_some() && e.remote.is_some())
                .unwrap_or(false)
        };
        if !ready(self.endpoints.get(key)) || !ready(self.endpoints.get(&mirror)) {
            return;
        }

        let tracks_of = |ep: Option<&Endpoint>| {
            ep.map(|e| e.senders.clone()).unwrap_or_default()
        };
        let here = tracks_of(self.endpoints.get(key));
        let there = tracks_of(self.endpoints.get(&mirror));

        for (k, remote_tracks, remote_id) in [(key, there, &key.1), (&mirror, here, &key.0)] {
            if let Some(ep) = self.endpoints.get_mut(k) {
                ep.connected = true;
                ep.ctx.emit(PeerEventKind::StateChanged(LinkState::Connected));
                for (kind, track_id) in remote_tracks {
                    ep.ctx.emit(PeerEventKind::RemoteTrack(RemoteTrackInfo {
                        kind,
                        track_id,
                        stream_id: remote_id.clone(),
                    }));
                }
            }
        }

        debug!("Loopback pair {} <-> {} connected", key.0, key.1);
    }
}

/// Shared in-process network; clones see the same links
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, local: &str, peer: &str, f: impl FnOnce(&Endpoint) -> T) -> Option<T> {
        let state = self.state.lock();
        state
            .endpoints
            .get(&(local.to_string(), peer.to_string()))
            .map(f)
    }

    /// Offers created by `local` towards `peer`
    pub fn offers_created(&self, local: &str, peer: &str) -> usize {
        self.read(local, peer, |ep| ep.offers).unwrap_or(0)
    }

    /// Offers created anywhere on the network
    pub fn total_offers(&self) -> usize {
        self.state.lock().total_offers
    }

    /// Remote candidates applied on `local`'s link to `peer`
    pub fn applied_candidates(&self, local: &str, peer: &str) -> usize {
        self.read(local, peer, |ep| ep.applied_candidates.len())
            .unwrap_or(0)
    }

    /// `replace_track` calls on `local`'s link to `peer`
    pub fn replaced_tracks(&self, local: &str, peer: &str) -> usize {
        self.read(local, peer, |ep| ep.replaced).unwrap_or(0)
    }

    /// Track id currently carried by the sender of `kind`
    pub fn sending_track(&self, local: &str, peer: &str, kind: TrackKind) -> Option<String> {
        self.read(local, peer, |ep| {
            ep.senders
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, id)| id.clone())
        })
        .flatten()
    }

    /// Whether `local`'s link to `peer` reported Connected
    pub fn is_connected(&self, local: &str, peer: &str) -> bool {
        self.read(local, peer, |ep| ep.connected && !ep.closed)
            .unwrap_or(false)
    }

    /// Whether `local`'s link to `peer` was closed
    pub fn is_closed(&self, local: &str, peer: &str) -> bool {
        self.read(local, peer, |ep| ep.closed).unwrap_or(false)
    }

    /// Simulate ICE failure on one end
    pub fn fail_link(&self, local: &str, peer: &str) {
        let mut state = self.state.lock();
        if let Some(ep) = state
            .endpoints
            .get_mut(&(local.to_string(), peer.to_string()))
        {
            ep.connected = false;
            ep.ctx.emit(PeerEventKind::StateChanged(LinkState::Failed));
        }
    }
}

#[async_trait]
impl PeerLinkFactory for LoopbackNetwork {
    async fn create(&self, ctx: LinkContext) -> Result<Arc<dyn PeerLink>> {
        let key = (ctx.local_id.clone(), ctx.peer_id.clone());
        let connection_id = ctx.connection_id;

        self.state.lock().endpoints.insert(
            key.clone(),
            Endpoint {
                ctx,
                local: None,
                remote: None,
                senders: Vec::new(),
                applied_candidates: Vec::new(),
                offers: 0,
                replaced: 0,
                connected: false,
                closed: false,
            },
        );

        Ok(Arc::new(LoopbackLink {
            net: self.clone(),
            key,
            connection_id,
        }))
    }
}

/// One end of a loopback pair
pub struct LoopbackLink {
    net: LoopbackNetwork,
    key: Key,
    connection_id: Uuid,
}

impl LoopbackLink {
    fn set_local(&self, sdp_type: SdpType) -> Result<SessionDescription> {
        let mut state = self.net.state.lock();
        let description = state.describe(&self.key, sdp_type);
        let candidate = state.host_candidate();

        let ep = state.endpoint(&self.key, self.connection_id)?;
        ep.local = Some(description.clone());
        if sdp_type == SdpType::Offer {
            ep.offers += 1;
        }
        ep.ctx.emit(PeerEventKind::LocalCandidate(candidate));

        if sdp_type == SdpType::Offer {
            state.total_offers += 1;
        }
        state.maybe_connect(&self.key);

        Ok(description)
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut state = self.net.state.lock();
        let ep = state.endpoint(&self.key, self.connection_id)?;
        ep.senders.push((track.kind(), track.id().to_string()));
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        let mut state = self.net.state.lock();
        let ep = state.endpoint(&self.key, self.connection_id)?;
        match ep.senders.iter_mut().find(|(k, _)| *k == kind) {
            Some(sender) => sender.1 = track.id().to_string(),
            None => {
                return Err(Error::negotiation(
                    &self.key.1,
                    format!("No {} sender to replace", kind),
                ))
            }
        }
        ep.replaced += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.set_local(SdpType::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        {
            let mut state = self.net.state.lock();
            let ep = state.endpoint(&self.key, self.connection_id)?;
            let has_offer = ep
                .remote
                .as_ref()
                .map(|r| r.sdp_type == SdpType::Offer)
                .unwrap_or(false);
            if !has_offer {
                return Err(Error::negotiation(
                    &self.key.1,
                    "Cannot answer without a remote offer",
                ));
            }
        }
        self.set_local(SdpType::Answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if !description.sdp.starts_with("v=0") {
            return Err(Error::negotiation(&self.key.1, "Malformed SDP"));
        }

        let mut state = self.net.state.lock();
        let ep = state.endpoint(&self.key, self.connection_id)?;

        if description.sdp_type == SdpType::Answer {
            let offered = ep
                .local
                .as_ref()
                .map(|l| l.sdp_type == SdpType::Offer)
                .unwrap_or(false);
            if !offered {
                return Err(Error::negotiation(
                    &self.key.1,
                    "Answer received without a local offer",
                ));
            }
        }

        ep.remote = Some(description);
        state.maybe_connect(&self.key);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.net.state.lock();
        let ep = state.endpoint(&self.key, self.connection_id)?;
        if ep.remote.is_none() {
            return Err(Error::negotiation(
                &self.key.1,
                "Candidate added before remote description",
            ));
        }
        ep.applied_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.net.state.lock();
        if let Some(ep) = state.endpoints.get_mut(&self.key) {
            if ep.ctx.connection_id == self.connection_id {
                ep.closed = true;
                ep.connected = false;
            }
        }
        Ok(())
    }
}
