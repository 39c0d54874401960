//! Local media: capture devices, tracks and the active outgoing stream.

pub mod device;
pub mod platform;
pub mod stream;
pub mod track;

pub use device::{DeviceDescriptor, DeviceKind, DeviceList, DeviceRegistry, DeviceSelection, DeviceSnapshot};
pub use platform::{CaptureConstraints, CapturePlatform, TrackConstraint};
pub use stream::{Acquired, ActivationRequest, InstallOutcome, SessionMode, StreamLifecycleManager};
pub use track::{MediaStreamHandle, MediaTrack, TrackKind, TrackState};
