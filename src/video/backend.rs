//! Platform camera boundary
//!
//! The camera manager never calls into a platform camera API directly. A
//! backend implements these three narrow traits, and reports everything
//! asynchronous (open completion, disconnects, errors, capture results)
//! by sending [`HardwareEvent`]s through the [`EventSink`] it was given at
//! open time. The sink is the only way back into the state machine.

use std::sync::Arc;
use tokio::sync::mpsc;

use super::device::DeviceCapabilities;
use super::face::DetectedFace;
use super::format::Facing;
use super::request::CaptureRequest;
use super::surface::Surface;
use crate::error::{AppError, Result};

/// Asynchronous notifications from the camera hardware
#[derive(Debug, Clone)]
pub enum HardwareEvent {
    /// The device finished opening and can create a capture session
    Opened,
    /// The device went away (unplugged, taken by a higher priority client)
    Disconnected,
    /// Fatal device error
    Error(String),
    /// Metadata for one completed frame
    CaptureCompleted(CaptureResult),
}

/// Per-frame metadata reported by the device
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    pub frame_number: u64,
    /// Exposure the sensor actually used (measured by AE when it is on)
    pub exposure_time_ns: Option<u64>,
    pub sensitivity: Option<u32>,
    /// Empty unless face detection is enabled in the request
    pub faces: Vec<DetectedFace>,
}

/// Sender half handed to a backend for one open attempt
///
/// Every event is tagged with the attempt's epoch; events from an attempt
/// that has since been closed are discarded by the receiver.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, HardwareEvent)>,
}

impl EventSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, HardwareEvent)>) -> Self {
        Self { epoch, tx }
    }

    /// Deliver an event. Returns false once the camera manager is gone.
    pub fn send(&self, event: HardwareEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Entry point of a platform camera stack
pub trait CameraBackend: Send + Sync {
    /// Ids of all cameras currently present
    fn device_ids(&self) -> Result<Vec<String>>;

    /// Query the capability set of one camera
    fn capabilities(&self, device_id: &str) -> Result<DeviceCapabilities>;

    /// Start opening a camera.
    ///
    /// Returns as soon as the request is accepted. Completion is reported
    /// through `events` as [`HardwareEvent::Opened`], failure as
    /// `Error`/`Disconnected`.
    fn open(&self, device_id: &str, events: EventSink) -> Result<Box<dyn CameraDevice>>;
}

/// An opened (or opening) camera
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    /// Configure a capture session writing into `outputs`
    fn create_session(&mut self, outputs: &[Arc<Surface>]) -> Result<Box<dyn CaptureSession>>;

    /// Release the device. Must be safe to call in any state.
    fn close(&mut self);
}

/// A configured capture session
pub trait CaptureSession: Send {
    /// Replace the repeating request
    fn set_repeating(&mut self, request: &CaptureRequest) -> Result<()>;

    fn stop_repeating(&mut self) -> Result<()>;

    /// Release the session; no frames are produced afterwards
    fn close(&mut self);
}

/// Pick the camera for `facing`: first match, else the first camera
pub fn find_by_facing(backend: &dyn CameraBackend, facing: Facing) -> Result<String> {
    let ids = backend.device_ids()?;
    for id in &ids {
        match backend.capabilities(id) {
            Ok(caps) if caps.facing == facing => return Ok(id.clone()),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping camera {}: {}", id, e),
        }
    }
    ids.into_iter()
        .next()
        .ok_or_else(|| AppError::device(facing.to_string(), "no camera detected"))
}
