//! Local device ownership: initial capture, enumeration, hot-swap, output routing

use super::backend::{
    CaptureRequest, MediaBackend, MediaDeviceInfo, MediaDeviceKind, MediaError, MediaErrorKind,
};
use super::surface::RenderSurface;
use super::track::{LocalStream, LocalTrack, TrackKind};
use crate::peer::PeerRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Deduplicated device lists, one per category, in platform order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceList {
    /// Microphones
    pub audio_inputs: Vec<MediaDeviceInfo>,
    /// Cameras
    pub video_inputs: Vec<MediaDeviceInfo>,
    /// Speakers and headsets
    pub audio_outputs: Vec<MediaDeviceInfo>,
}

impl DeviceList {
    /// Collapse raw entries that share a physical device
    ///
    /// Entries are keyed by `(kind, group_id)`. A later entry replaces the
    /// earlier one but keeps its position, so a "default" alias followed by
    /// the concrete endpoint yields the concrete endpoint.
    pub fn from_raw(raw: Vec<MediaDeviceInfo>) -> Self {
        let mut slots: HashMap<(MediaDeviceKind, String), usize> = HashMap::new();
        let mut ordered: Vec<MediaDeviceInfo> = Vec::new();

        for device in raw {
            let key = (device.kind, device.group_id.clone());
            match slots.get(&key) {
                Some(&index) => ordered[index] = device,
                None => {
                    slots.insert(key, ordered.len());
                    ordered.push(device);
                }
            }
        }

        let mut list = Self::default();
        for device in ordered {
            match device.kind {
                MediaDeviceKind::AudioInput => list.audio_inputs.push(device),
                MediaDeviceKind::VideoInput => list.video_inputs.push(device),
                MediaDeviceKind::AudioOutput => list.audio_outputs.push(device),
            }
        }
        list
    }
}

/// What the initial capture ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureMode {
    /// Microphone and camera
    AudioVideo,
    /// Microphone only
    AudioOnly,
    /// Camera only
    VideoOnly,
    /// Nothing; the participant can only watch
    None,
}

/// Result of the degrading initial capture
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// Capability reached
    pub mode: CaptureMode,
    /// First failure met on the way down, if any
    pub error: Option<MediaError>,
}

/// Current device choice per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSelection {
    /// Selected microphone
    pub audio_input: Option<String>,
    /// Selected camera
    pub video_input: Option<String>,
    /// Selected output
    pub audio_output: Option<String>,
}

/// Owner of the local capture set
///
/// The session holds exactly one manager. Peer connections only ever borrow
/// its tracks; stopping a track happens here and nowhere else.
pub struct MediaDeviceManager {
    backend: Arc<dyn MediaBackend>,
    stream: LocalStream,
    selection: DeviceSelection,
    surfaces: Vec<Arc<dyn RenderSurface>>,
}

impl MediaDeviceManager {
    /// Create a manager over a capture backend
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            stream: LocalStream::default(),
            selection: DeviceSelection::default(),
            surfaces: Vec::new(),
        }
    }

    /// Current local tracks, audio first
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.stream.tracks()
    }

    /// Current track of a kind
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.stream.track(kind)
    }

    /// Current device selection
    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    /// Capture with graceful degradation: audio+video, then audio, then nothing
    ///
    /// Never fails; the outcome says what was obtained. If tracks are already
    /// held (a retried join) they are kept as they are.
    pub async fn acquire_initial(&mut self) -> CaptureOutcome {
        if self.stream.track(TrackKind::Audio).is_some() {
            return CaptureOutcome {
                mode: self.held_mode(),
                error: None,
            };
        }
        if !self.stream.is_empty() {
            debug!("Releasing camera-only capture before the full request");
            self.stop_all();
        }

        let first_error = match self.backend.acquire(&CaptureRequest::audio_video()).await {
            Ok(tracks) => {
                self.install(tracks);
                info!("Captured audio and video");
                return CaptureOutcome {
                    mode: CaptureMode::AudioVideo,
                    error: None,
                };
            }
            Err(e) => {
                warn!("Audio+video capture failed, retrying audio only: {}", e);
                e
            }
        };

        match self.backend.acquire(&CaptureRequest::audio_only()).await {
            Ok(tracks) => {
                self.install(tracks);
                info!("Captured audio only");
                CaptureOutcome {
                    mode: CaptureMode::AudioOnly,
                    error: Some(first_error),
                }
            }
            Err(e) => {
                warn!("Audio capture failed, joining without media: {}", e);
                CaptureOutcome {
                    mode: CaptureMode::None,
                    error: Some(first_error),
                }
            }
        }
    }

    /// Capability of the tracks currently held
    pub fn held_mode(&self) -> CaptureMode {
        match (
            self.stream.track(TrackKind::Audio).is_some(),
            self.stream.track(TrackKind::Video).is_some(),
        ) {
            (true, true) => CaptureMode::AudioVideo,
            (true, false) => CaptureMode::AudioOnly,
            (false, true) => CaptureMode::VideoOnly,
            (false, false) => CaptureMode::None,
        }
    }

    fn install(&mut self, tracks: Vec<LocalTrack>) {
        for track in tracks {
            match track.kind() {
                TrackKind::Audio => self.selection.audio_input = Some(track.device_id().to_string()),
                TrackKind::Video => self.selection.video_input = Some(track.device_id().to_string()),
            }
            if let Some(old) = self.stream.replace(track) {
                old.stop();
            }
        }
    }

    /// List physical devices per category
    pub async fn enumerate_devices(&self) -> Result<DeviceList, MediaError> {
        let raw = self.backend.enumerate().await?;
        Ok(DeviceList::from_raw(raw))
    }

    /// Switch capture to an exact device and push it to every live connection
    ///
    /// The new track is acquired first; on failure nothing changes. On
    /// success it inherits the enabled flag of the track it replaces, is sent
    /// through the existing senders of every active connection, and the old
    /// track is stopped.
    ///
    /// # Errors
    ///
    /// Returns the backend's typed failure (the caller picks the fallback).
    pub async fn change_input(
        &mut self,
        kind: TrackKind,
        device_id: &str,
        peers: Option<&mut PeerRegistry>,
    ) -> Result<LocalTrack, MediaError> {
        info!("Switching {} input to {}", kind, device_id);

        let acquired = self
            .backend
            .acquire(&CaptureRequest::exact(kind, device_id))
            .await?;

        let mut new_track = None;
        for track in acquired {
            if track.kind() == kind && new_track.is_none() {
                new_track = Some(track);
            } else {
                track.stop();
            }
        }
        let new_track = new_track.ok_or_else(|| {
            MediaError::new(
                MediaErrorKind::Unknown,
                format!("Backend returned no {} track", kind),
            )
        })?;

        if let Some(old) = self.stream.track(kind) {
            new_track.set_enabled(old.is_enabled());
        }

        if let Some(peers) = peers {
            let stats = peers.replace_track(kind, &new_track).await;
            debug!(
                "Replaced {} track on {} connection(s), {} failed",
                kind, stats.replaced, stats.failed
            );
        }

        if let Some(old) = self.stream.replace(new_track.clone()) {
            old.stop();
        }

        match kind {
            TrackKind::Audio => self.selection.audio_input = Some(device_id.to_string()),
            TrackKind::Video => self.selection.video_input = Some(device_id.to_string()),
        }

        Ok(new_track)
    }

    /// Route audio of every surface to an output device
    ///
    /// Surfaces attached later pick up the same selection.
    pub fn change_output(&mut self, device_id: &str) -> Result<(), MediaError> {
        info!("Switching audio output to {}", device_id);

        for surface in &self.surfaces {
            surface.set_output_device(device_id)?;
        }

        self.selection.audio_output = Some(device_id.to_string());
        Ok(())
    }

    /// Register a rendering surface, applying the current output selection
    pub fn attach_surface(&mut self, surface: Arc<dyn RenderSurface>) -> Result<(), MediaError> {
        if let Some(output) = &self.selection.audio_output {
            surface.set_output_device(output)?;
        }
        self.surfaces.retain(|s| s.id() != surface.id());
        self.surfaces.push(surface);
        Ok(())
    }

    /// Forget a rendering surface
    pub fn detach_surface(&mut self, id: &str) {
        self.surfaces.retain(|s| s.id() != id);
    }

    /// Stop every local track and drop the capture set
    pub fn stop_all(&mut self) {
        self.stream.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FailureTarget, HeadlessSurface, SyntheticBackend};

    fn manager() -> (MediaDeviceManager, Arc<SyntheticBackend>) {
        let backend = Arc::new(SyntheticBackend::with_default_devices());
        (MediaDeviceManager::new(backend.clone()), backend)
    }

    #[test]
    fn test_dedup_by_group_last_wins_in_place() {
        let list = DeviceList::from_raw(vec![
            MediaDeviceInfo::new(MediaDeviceKind::AudioInput, "default", "g1", "Default"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioInput, "mic-2", "g2", "Headset"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioInput, "mic-1", "g1", "Built-in"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioOutput, "spk-1", "g1", "Speakers"),
        ]);

        let ids: Vec<_> = list.audio_inputs.iter().map(|d| d.device_id.as_str()).collect();
        assert_eq!(ids, vec!["mic-1", "mic-2"]);
        assert_eq!(list.audio_outputs.len(), 1);
        assert!(list.video_inputs.is_empty());
    }

    #[tokio::test]
    async fn test_enumerate_default_devices() {
        let (manager, _) = manager();
        let list = manager.enumerate_devices().await.unwrap();
        assert_eq!(list.audio_inputs.len(), 2);
        assert_eq!(list.video_inputs.len(), 2);
        assert_eq!(list.audio_outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_initial_capture_degrades_to_audio() {
        let (mut manager, backend) = manager();
        backend.fail(FailureTarget::Kind(TrackKind::Video), MediaErrorKind::DeviceBusy);

        let outcome = manager.acquire_initial().await;
        assert_eq!(outcome.mode, CaptureMode::AudioOnly);
        assert_eq!(outcome.error.unwrap().kind, MediaErrorKind::DeviceBusy);
        assert!(manager.track(TrackKind::Audio).is_some());
        assert!(manager.track(TrackKind::Video).is_none());
    }

    #[tokio::test]
    async fn test_initial_capture_degrades_to_nothing() {
        let (mut manager, backend) = manager();
        backend.fail(FailureTarget::Kind(TrackKind::Audio), MediaErrorKind::PermissionDenied);

        let outcome = manager.acquire_initial().await;
        assert_eq!(outcome.mode, CaptureMode::None);
        assert!(manager.tracks().is_empty());
    }

    #[tokio::test]
    async fn test_change_input_stops_old_and_keeps_enabled_flag() {
        let (mut manager, _) = manager();
        manager.acquire_initial().await;

        let old = manager.track(TrackKind::Video).cloned().unwrap();
        old.set_enabled(false);

        let new = manager
            .change_input(TrackKind::Video, "cam-usb", None)
            .await
            .unwrap();
        assert!(old.is_stopped());
        assert!(!new.is_stopped());
        assert!(!new.is_enabled());
        assert_eq!(new.device_id(), "cam-usb");
        assert_eq!(manager.selection().video_input.as_deref(), Some("cam-usb"));
    }

    #[tokio::test]
    async fn test_failed_change_input_keeps_previous() {
        let (mut manager, backend) = manager();
        manager.acquire_initial().await;
        backend.fail(FailureTarget::Device("cam-usb".to_string()), MediaErrorKind::DeviceBusy);

        let err = manager
            .change_input(TrackKind::Video, "cam-usb", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, MediaErrorKind::DeviceBusy);

        let current = manager.track(TrackKind::Video).unwrap();
        assert_eq!(current.device_id(), "cam-front");
        assert!(!current.is_stopped());
        assert_eq!(manager.selection().video_input.as_deref(), Some("cam-front"));
    }

    #[tokio::test]
    async fn test_output_applies_to_existing_and_later_surfaces() {
        let (mut manager, _) = manager();
        let local = Arc::new(HeadlessSurface::new("local"));
        manager.attach_surface(local.clone()).unwrap();

        manager.change_output("spk-headset").unwrap();
        assert_eq!(local.output_device().as_deref(), Some("spk-headset"));

        let remote = Arc::new(HeadlessSurface::new("peer-2"));
        manager.attach_surface(remote.clone()).unwrap();
        assert_eq!(remote.output_device().as_deref(), Some("spk-headset"));
    }

    #[tokio::test]
    async fn test_camera_only_capture_is_redone_in_full() {
        let (mut manager, _) = manager();
        let cam = manager
            .change_input(TrackKind::Video, "cam-usb", None)
            .await
            .unwrap();
        assert_eq!(manager.held_mode(), CaptureMode::VideoOnly);

        let outcome = manager.acquire_initial().await;

        assert_eq!(outcome.mode, CaptureMode::AudioVideo);
        assert!(cam.is_stopped());
        assert!(manager.track(TrackKind::Audio).is_some());
        assert_eq!(manager.held_mode(), CaptureMode::AudioVideo);
    }

    #[tokio::test]
    async fn test_held_audio_only_is_reported_as_such() {
        let (mut manager, backend) = manager();
        backend.fail(FailureTarget::Kind(TrackKind::Video), MediaErrorKind::NotFound);
        manager.acquire_initial().await;

        let again = manager.acquire_initial().await;
        assert_eq!(again.mode, CaptureMode::AudioOnly);
        assert!(again.error.is_none());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (mut manager, backend) = manager();
        manager.acquire_initial().await;
        manager.stop_all();
        assert!(manager.tracks().is_empty());
        assert!(backend.issued_tracks().iter().all(|t| t.is_stopped()));
    }
}
