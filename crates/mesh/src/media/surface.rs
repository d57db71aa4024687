//! Rendering surfaces (local preview, remote tiles)

use super::backend::MediaError;
use parking_lot::Mutex;

/// Something that plays media and can be routed to an output device
pub trait RenderSurface: Send + Sync {
    /// Stable surface id (usually the peer id, or `local`)
    fn id(&self) -> &str;

    /// Route audio to the given output device
    fn set_output_device(&self, device_id: &str) -> Result<(), MediaError>;
}

/// Surface that only remembers its routing; used headless and in tests
#[derive(Debug)]
pub struct HeadlessSurface {
    id: String,
    output: Mutex<Option<String>>,
}

impl HeadlessSurface {
    /// Create a surface with no output selected
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            output: Mutex::new(None),
        }
    }

    /// Output device currently selected
    pub fn output_device(&self) -> Option<String> {
        self.output.lock().clone()
    }
}

impl RenderSurface for HeadlessSurface {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_output_device(&self, device_id: &str) -> Result<(), MediaError> {
        *self.output.lock() = Some(device_id.to_string());
        Ok(())
    }
}
