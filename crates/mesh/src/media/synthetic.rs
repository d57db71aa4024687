//! Synthetic capture backend
//!
//! Serves a fixed device list and hands out tracks that carry no real media.
//! Failures can be injected per kind or per device, which is how the
//! degradation paths are exercised.

use super::backend::{
    CaptureRequest, DeviceConstraint, MediaBackend, MediaDeviceInfo, MediaDeviceKind, MediaError,
    MediaErrorKind,
};
use super::track::{LocalTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Where an injected failure applies
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureTarget {
    /// Any request including this kind
    Kind(TrackKind),
    /// Any request naming this exact device
    Device(String),
}

#[derive(Default)]
struct SyntheticState {
    failures: HashMap<FailureTarget, MediaErrorKind>,
    issued: Vec<LocalTrack>,
    acquire_calls: usize,
}

/// In-memory [`MediaBackend`]
pub struct SyntheticBackend {
    devices: Vec<MediaDeviceInfo>,
    delay: Option<Duration>,
    state: Mutex<SyntheticState>,
}

impl SyntheticBackend {
    /// Backend with the given raw device list
    pub fn new(devices: Vec<MediaDeviceInfo>) -> Self {
        Self {
            devices,
            delay: None,
            state: Mutex::new(SyntheticState::default()),
        }
    }

    /// A laptop-like set: two endpoints for the built-in mic (same group),
    /// a USB headset, two cameras and two outputs.
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            MediaDeviceInfo::new(MediaDeviceKind::AudioInput, "default", "builtin", "Default - Built-in Microphone"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioInput, "mic-builtin", "builtin", "Built-in Microphone"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioInput, "mic-headset", "headset", "USB Headset"),
            MediaDeviceInfo::new(MediaDeviceKind::VideoInput, "cam-front", "cam-front", "FaceTime HD Camera"),
            MediaDeviceInfo::new(MediaDeviceKind::VideoInput, "cam-usb", "cam-usb", "USB Camera"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioOutput, "default", "builtin", "Default - Built-in Speakers"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioOutput, "spk-builtin", "builtin", "Built-in Speakers"),
            MediaDeviceInfo::new(MediaDeviceKind::AudioOutput, "spk-headset", "headset", "USB Headset"),
        ])
    }

    /// Delay every acquisition (to race it against teardown)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make matching requests fail with `kind` until cleared
    pub fn fail(&self, target: FailureTarget, kind: MediaErrorKind) {
        self.state.lock().failures.insert(target, kind);
    }

    /// Remove an injected failure
    pub fn clear_failure(&self, target: &FailureTarget) {
        self.state.lock().failures.remove(target);
    }

    /// Every track handed out so far
    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().issued.clone()
    }

    /// Number of `acquire` calls
    pub fn acquire_calls(&self) -> usize {
        self.state.lock().acquire_calls
    }

    fn resolve(
        &self,
        kind: TrackKind,
        constraint: &DeviceConstraint,
    ) -> Result<&MediaDeviceInfo, MediaError> {
        let device_kind = MediaDeviceKind::input_for(kind);
        let mut candidates = self.devices.iter().filter(|d| d.kind == device_kind);

        match constraint {
            DeviceConstraint::Any => candidates.next().ok_or_else(|| {
                MediaError::new(MediaErrorKind::NotFound, format!("No {} input device", kind))
            }),
            DeviceConstraint::Exact(id) => candidates.find(|d| &d.device_id == id).ok_or_else(|| {
                MediaError::new(
                    MediaErrorKind::Overconstrained,
                    format!("No {} device with id {}", kind, id),
                )
            }),
        }
    }
}

#[async_trait]
impl MediaBackend for SyntheticBackend {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(self.devices.clone())
    }

    async fn acquire(&self, request: &CaptureRequest) -> Result<Vec<LocalTrack>, MediaError> {
        self.state.lock().acquire_calls += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut resolved = Vec::new();
        for kind in request.kinds() {
            let constraint = request
                .constraint(kind)
                .cloned()
                .unwrap_or(DeviceConstraint::Any);

            let state = self.state.lock();
            if let Some(failure) = state.failures.get(&FailureTarget::Kind(kind)) {
                return Err(MediaError::new(*failure, format!("{} capture refused", kind)));
            }
            drop(state);

            let device = self.resolve(kind, &constraint)?;

            let state = self.state.lock();
            if let Some(failure) = state
                .failures
                .get(&FailureTarget::Device(device.device_id.clone()))
            {
                return Err(MediaError::new(
                    *failure,
                    format!("Device {} unavailable", device.device_id),
                ));
            }
            drop(state);

            resolved.push((kind, device.device_id.clone(), device.label.clone()));
        }

        let tracks: Vec<LocalTrack> = resolved
            .into_iter()
            .map(|(kind, device_id, label)| LocalTrack::new(kind, device_id, label))
            .collect();

        debug!("Synthetic backend issued {} track(s)", tracks.len());
        self.state.lock().issued.extend(tracks.iter().cloned());

        Ok(tracks)
    }
}
