//! Local capture tracks
//!
//! A [`LocalTrack`] is a cheap, clonable handle. Every peer link that carries
//! it shares the same underlying RTP track, so muting or stopping it is seen
//! by all of them at once.

use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Kind of media a track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    device_id: String,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

/// Handle to one captured audio or video track
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Create a track bound to a capture device
    ///
    /// # Arguments
    ///
    /// * `kind` - Audio or video
    /// * `device_id` - Device the track captures from
    /// * `label` - Human readable device label
    pub fn new(kind: TrackKind, device_id: impl Into<String>, label: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let rtp = Arc::new(TrackLocalStaticSample::new(
            kind.codec(),
            id.clone(),
            "local".to_string(),
        ));

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                device_id: device_id.into(),
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                rtp,
            }),
        }
    }

    /// Unique track id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Capture device this track is bound to
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether samples are currently forwarded
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without touching any connection
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the capture has been released
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Release the capture; idempotent
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!(
                "Stopped {} track {} ({})",
                self.inner.kind, self.inner.id, self.inner.device_id
            );
        }
    }

    /// RTP track shared by every sender carrying this capture
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    /// Whether two handles refer to the same capture
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Push one encoded frame to every connection carrying this track
    ///
    /// Frames are dropped silently while the track is disabled or stopped.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }

        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };

        self.inner
            .rtp
            .write_sample(&sample)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to write sample: {}", e)))
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The local capture set: at most one track per kind
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalStream {
    /// Build a stream from acquired tracks (last track of a kind wins)
    pub fn from_tracks(tracks: Vec<LocalTrack>) -> Self {
        let mut stream = Self::default();
        for track in tracks {
            if let Some(old) = stream.replace(track) {
                old.stop();
            }
        }
        stream
    }

    /// Track of the given kind, if captured
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Install a track, returning the one it displaced
    pub fn replace(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match track.kind() {
            TrackKind::Audio => self.audio.replace(track),
            TrackKind::Video => self.video.replace(track),
        }
    }

    /// All tracks, audio first
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    /// Whether nothing is captured
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    /// Stop and drop every track
    pub fn stop_all(&mut self) {
        for track in self.audio.take().into_iter().chain(self.video.take()) {
            track.stop();
        }
    }
}
