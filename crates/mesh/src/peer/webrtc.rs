//! webrtc-rs backed peer links

use super::link::{
    LinkContext, LinkState, PeerEventKind, PeerLink, PeerLinkFactory, RemoteTrackInfo,
};
use crate::config::IceServerConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::protocol::SdpType;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`WebRtcPeerLink`]s sharing one API instance and ICE server list
pub struct WebRtcLinkFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcLinkFactory {
    /// Create a factory
    ///
    /// The ICE servers are fixed here and handed to every connection at
    /// construction; they are never renegotiated.
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![server.url.clone()],
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                }
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

#[async_trait]
impl PeerLinkFactory for WebRtcLinkFactory {
    #[instrument(skip(self, ctx), fields(peer_id = %ctx.peer_id, connection_id = %ctx.connection_id))]
    async fn create(&self, ctx: LinkContext) -> Result<Arc<dyn PeerLink>> {
        info!("Creating peer connection to {}", ctx.peer_id);

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let state_ctx = ctx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let ctx = state_ctx.clone();
            Box::pin(async move {
                if let Some(state) = link_state(s) {
                    debug!("Peer {} state: {:?}", ctx.peer_id, state);
                    ctx.emit(PeerEventKind::StateChanged(state));
                }
            })
        }));

        let ice_ctx = ctx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ctx = ice_ctx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => ctx.emit(PeerEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let track_ctx = ctx.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let ctx = track_ctx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    info!("Remote {} track from {}", kind, ctx.peer_id);
                    ctx.emit(PeerEventKind::RemoteTrack(RemoteTrackInfo {
                        kind,
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                    }));
                })
            },
        ));

        Ok(Arc::new(WebRtcPeerLink {
            peer_id: ctx.peer_id,
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// WebRTC peer connection wrapper
pub struct WebRtcPeerLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl WebRtcPeerLink {
    async fn local_description(&self, what: &str) -> Result<String> {
        self.pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| {
                Error::negotiation(&self.peer_id, format!("No local description after {}", what))
            })
    }
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // RTCP must be drained for the interceptors to work
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind(), sender);
        debug!("{} track added to peer {}", track.kind(), self.peer_id);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: &LocalTrack) -> Result<()> {
        let sender = self.senders.lock().get(&kind).cloned().ok_or_else(|| {
            Error::negotiation(&self.peer_id, format!("No {} sender to replace", kind))
        })?;

        sender
            .replace_track(Some(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to replace {} track: {}", kind, e)))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::negotiation(&self.peer_id, format!("Failed to create offer: {}", e)))?;

        self.pc.set_local_description(offer).await.map_err(|e| {
            Error::negotiation(&self.peer_id, format!("Failed to set local description: {}", e))
        })?;

        debug!("Created SDP offer for peer {}", self.peer_id);
        Ok(SessionDescription::offer(self.local_description("offer").await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            Error::negotiation(&self.peer_id, format!("Failed to create answer: {}", e))
        })?;

        self.pc.set_local_description(answer).await.map_err(|e| {
            Error::negotiation(&self.peer_id, format!("Failed to set local description: {}", e))
        })?;

        debug!("Created SDP answer for peer {}", self.peer_id);
        Ok(SessionDescription::answer(self.local_description("answer").await?))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let parsed = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(Error::negotiation(&self.peer_id, "Rollback is not supported"))
            }
        }
        .map_err(|e| Error::negotiation(&self.peer_id, format!("Failed to parse SDP: {}", e)))?;

        self.pc.set_remote_description(parsed).await.map_err(|e| {
            Error::negotiation(&self.peer_id, format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc.add_ice_candidate(init).await.map_err(|e| {
            Error::negotiation(&self.peer_id, format!("Failed to add ICE candidate: {}", e))
        })
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);
        self.senders.lock().clear();
        self.pc.close().await.map_err(|e| Error::ConnectionLifecycle {
            peer_id: self.peer_id.clone(),
            reason: format!("Failed to close connection: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::link::PeerEvent;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn ctx(peer: &str) -> (LinkContext, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            LinkContext {
                local_id: "local".to_string(),
                peer_id: peer.to_string(),
                connection_id: Uuid::new_v4(),
                events,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_offer_contains_local_tracks() {
        let factory = WebRtcLinkFactory::new(&[]).unwrap();
        let (ctx, _rx) = ctx("remote");
        let link = factory.create(ctx).await.unwrap();

        link.add_track(&LocalTrack::new(TrackKind::Audio, "mic", "Mic"))
            .await
            .unwrap();
        link.add_track(&LocalTrack::new(TrackKind::Video, "cam", "Cam"))
            .await
            .unwrap();

        let offer = link.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_links() {
        let factory = WebRtcLinkFactory::new(&[]).unwrap();
        let (a_ctx, _a_rx) = ctx("b");
        let (b_ctx, _b_rx) = ctx("a");
        let a = factory.create(a_ctx).await.unwrap();
        let b = factory.create(b_ctx).await.unwrap();

        let track = LocalTrack::new(TrackKind::Audio, "mic", "Mic");
        a.add_track(&track).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        assert!(answer.sdp.starts_with("v=0"));
        a.set_remote_description(answer).await.unwrap();

        let replacement = LocalTrack::new(TrackKind::Audio, "mic-2", "Headset");
        a.replace_track(TrackKind::Audio, &replacement).await.unwrap();

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_sdp_is_negotiation_error() {
        let factory = WebRtcLinkFactory::new(&[]).unwrap();
        let (ctx, _rx) = ctx("remote");
        let link = factory.create(ctx).await.unwrap();
        let result = link
            .set_remote_description(SessionDescription::answer("not sdp"))
            .await;
        assert!(matches!(result, Err(Error::Negotiation { .. })));
    }
}
