//! Camera capture
//!
//! Capability model, manual control state, the camera state machine and the
//! sources that feed frames into an encoder surface.

pub mod backend;
pub mod camera;
pub mod controls;
pub mod device;
pub mod face;
pub mod format;
pub mod frame;
pub mod request;
pub mod source;
pub mod surface;
pub mod uvc;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{CameraBackend, CameraDevice, CaptureResult, CaptureSession, EventSink, HardwareEvent};
pub use camera::{CameraManager, CaptureConfiguration, ControlApplied, SessionState};
pub use controls::{Focus, ManualControl, ManualSettings, SettingKind, WhiteBalance};
pub use device::DeviceCapabilities;
pub use format::{Facing, PixelFormat, Resolution};
pub use frame::VideoFrame;
pub use source::{CameraSource, VideoSource};
pub use surface::Surface;
pub use uvc::{UvcDeviceInfo, UvcSource};
