//! Capture backend seam and typed media failures

use super::track::{LocalTrack, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a capture request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaErrorKind {
    /// No device of the requested kind (or with the requested id)
    NotFound,
    /// The user or platform refused access
    PermissionDenied,
    /// The device exists but another application holds it
    DeviceBusy,
    /// The device cannot satisfy the requested constraints
    Overconstrained,
    /// Anything the platform does not classify
    Unknown,
}

impl fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaErrorKind::NotFound => "NotFound",
            MediaErrorKind::PermissionDenied => "PermissionDenied",
            MediaErrorKind::DeviceBusy => "DeviceBusy",
            MediaErrorKind::Overconstrained => "Overconstrained",
            MediaErrorKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Media acquisition error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("Media acquisition failed ({kind}): {message}")]
pub struct MediaError {
    /// Failure classification
    pub kind: MediaErrorKind,
    /// Platform detail
    pub message: String,
}

impl MediaError {
    /// Create a media error
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Banner text shown to the user
    pub fn user_message(&self) -> String {
        match self.kind {
            MediaErrorKind::NotFound => "No camera or microphone found".to_string(),
            MediaErrorKind::PermissionDenied => "Camera/microphone permission denied".to_string(),
            MediaErrorKind::DeviceBusy => {
                "Could not start video source - camera may be in use by another app".to_string()
            }
            MediaErrorKind::Overconstrained => {
                "Camera constraints could not be satisfied".to_string()
            }
            MediaErrorKind::Unknown => format!("Could not access media devices: {}", self.message),
        }
    }
}

/// Physical or logical device category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaDeviceKind {
    /// Microphone
    AudioInput,
    /// Camera
    VideoInput,
    /// Speaker or headset
    AudioOutput,
}

impl MediaDeviceKind {
    /// Input kind matching a track kind
    pub fn input_for(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => MediaDeviceKind::AudioInput,
            TrackKind::Video => MediaDeviceKind::VideoInput,
        }
    }
}

/// One raw device entry as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    /// Logical endpoint id
    pub device_id: String,
    /// Physical device id; several endpoints may share one
    pub group_id: String,
    /// Category
    pub kind: MediaDeviceKind,
    /// Label
    pub label: String,
}

impl MediaDeviceInfo {
    /// Create a device entry
    pub fn new(
        kind: MediaDeviceKind,
        device_id: impl Into<String>,
        group_id: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            group_id: group_id.into(),
            kind,
            label: label.into(),
        }
    }
}

/// Device selector for one kind in a capture request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceConstraint {
    /// Platform default
    Any,
    /// Exactly this device id
    Exact(String),
}

/// What to capture
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureRequest {
    /// Microphone selector; `None` means no audio
    pub audio: Option<DeviceConstraint>,
    /// Camera selector; `None` means no video
    pub video: Option<DeviceConstraint>,
}

impl CaptureRequest {
    /// Default microphone and camera
    pub fn audio_video() -> Self {
        Self {
            audio: Some(DeviceConstraint::Any),
            video: Some(DeviceConstraint::Any),
        }
    }

    /// Default microphone only
    pub fn audio_only() -> Self {
        Self {
            audio: Some(DeviceConstraint::Any),
            video: None,
        }
    }

    /// One exact device of one kind
    pub fn exact(kind: TrackKind, device_id: &str) -> Self {
        let constraint = Some(DeviceConstraint::Exact(device_id.to_string()));
        match kind {
            TrackKind::Audio => Self {
                audio: constraint,
                video: None,
            },
            TrackKind::Video => Self {
                audio: None,
                video: constraint,
            },
        }
    }

    /// Kinds requested, audio first
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio.is_some() {
            kinds.push(TrackKind::Audio);
        }
        if self.video.is_some() {
            kinds.push(TrackKind::Video);
        }
        kinds
    }

    /// Selector for one kind
    pub fn constraint(&self, kind: TrackKind) -> Option<&DeviceConstraint> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }
}

/// Platform capture access
///
/// A request either yields every requested track or fails as a whole.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// List raw device entries
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;

    /// Open capture for the requested kinds
    async fn acquire(&self, request: &CaptureRequest) -> Result<Vec<LocalTrack>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let denied = MediaError::new(MediaErrorKind::PermissionDenied, "NotAllowedError");
        assert_eq!(denied.user_message(), "Camera/microphone permission denied");

        let missing = MediaError::new(MediaErrorKind::NotFound, "no devices");
        assert_eq!(missing.user_message(), "No camera or microphone found");

        let unknown = MediaError::new(MediaErrorKind::Unknown, "driver crashed");
        assert!(unknown.user_message().contains("driver crashed"));
    }

    #[test]
    fn test_error_display() {
        let err = MediaError::new(MediaErrorKind::DeviceBusy, "in use");
        assert_eq!(
            err.to_string(),
            "Media acquisition failed (DeviceBusy): in use"
        );
    }

    #[test]
    fn test_exact_request() {
        let request = CaptureRequest::exact(TrackKind::Video, "cam-2");
        assert_eq!(request.kinds(), vec![TrackKind::Video]);
        assert_eq!(
            request.constraint(TrackKind::Video),
            Some(&DeviceConstraint::Exact("cam-2".to_string()))
        );
        assert!(request.constraint(TrackKind::Audio).is_none());
        assert_eq!(
            CaptureRequest::audio_video().kinds(),
            vec![TrackKind::Audio, TrackKind::Video]
        );
    }
}
