use async_trait::async_trait;

use super::device::{DeviceDescriptor, DeviceSelection};
use super::track::MediaStreamHandle;
use crate::error::CaptureError;

/// Constraint for one kind of track in a capture request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrackConstraint {
    /// Do not capture this kind
    Disabled,
    /// Let the platform pick its default device
    #[default]
    Any,
    /// Capture from the device with this id
    Device(String),
}

impl TrackConstraint {
    fn for_device(device_id: Option<&str>) -> Self {
        match device_id {
            Some(id) if !id.is_empty() => TrackConstraint::Device(id.to_string()),
            _ => TrackConstraint::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureConstraints {
    pub audio: TrackConstraint,
    pub video: TrackConstraint,
}

impl CaptureConstraints {
    /// Camera and microphone capture for a device selection.
    pub fn for_selection(selection: &DeviceSelection) -> Self {
        Self {
            audio: TrackConstraint::for_device(selection.audio.as_deref()),
            video: TrackConstraint::for_device(selection.video.as_deref()),
        }
    }

    /// Video-only display capture.
    pub fn display() -> Self {
        Self {
            audio: TrackConstraint::Disabled,
            video: TrackConstraint::Any,
        }
    }
}

/// Host capture API: device enumeration, camera/microphone and display capture.
#[async_trait]
pub trait CapturePlatform: Send + Sync {
    /// List every media device the host knows about, labeled or not.
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError>;

    async fn get_display_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStreamHandle, CaptureError>;
}
