//! Local media: capture tracks, device management, rendering surfaces

pub mod backend;
pub mod devices;
pub mod surface;
pub mod synthetic;
pub mod track;

pub use backend::{
    CaptureRequest, DeviceConstraint, MediaBackend, MediaDeviceInfo, MediaDeviceKind, MediaError,
    MediaErrorKind,
};
pub use devices::{CaptureMode, CaptureOutcome, DeviceList, DeviceSelection, MediaDeviceManager};
pub use surface::{HeadlessSurface, RenderSurface};
pub use synthetic::{FailureTarget, SyntheticBackend};
pub use track::{LocalStream, LocalTrack, TrackKind};
