//! In-memory camera backend for tests

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::backend::{CameraBackend, CameraDevice, CaptureSession, EventSink, HardwareEvent};
use super::device::{AfMode, DeviceCapabilities, FaceDetectMode, HardwareLevel};
use super::format::{Facing, Range, Rect, Resolution};
use super::request::CaptureRequest;
use super::surface::Surface;
use crate::error::{AppError, Result};

/// Full-featured back camera on a legacy HAL (crop-region zoom)
pub fn test_caps(id: &str) -> DeviceCapabilities {
    let mut caps = DeviceCapabilities::minimal(
        id,
        Facing::Back,
        vec![
            Resolution::new(640, 480),
            Resolution::HD720,
            Resolution::HD1080,
        ],
    );
    caps.hardware_level = HardwareLevel::Legacy;
    caps.iso_range = Some(Range::new(100, 3200));
    caps.exposure_time_range = Some(Range::new(100_000, 500_000_000));
    caps.ev_range = Some(Range::new(-6, 6));
    caps.max_digital_zoom = 4.0;
    caps.active_array = Rect::new(0, 0, 4000, 3000);
    caps.flash_available = true;
    caps.video_stabilization = true;
    caps.af_modes = vec![AfMode::Off, AfMode::Auto, AfMode::ContinuousVideo];
    caps.face_detect_modes = vec![FaceDetectMode::Off, FaceDetectMode::Simple];
    caps.max_face_count = 4;
    caps
}

#[derive(Default)]
struct Shared {
    devices: Vec<DeviceCapabilities>,
    manual_open: AtomicBool,
    fail_session: AtomicBool,
    open_calls: AtomicUsize,
    open_devices: AtomicUsize,
    repeating: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    requests: Mutex<Vec<CaptureRequest>>,
}

/// Scripted backend. Devices open immediately unless `with_manual_open`
/// is used, in which case the test fires `Opened` through [`emit`](Self::emit).
#[derive(Clone)]
pub struct FakeBackend {
    shared: Arc<Shared>,
}

impl FakeBackend {
    pub fn new(devices: Vec<DeviceCapabilities>) -> Self {
        Self {
            shared: Arc::new(Shared {
                devices,
                ..Default::default()
            }),
        }
    }

    pub fn with_manual_open(self) -> Self {
        self.shared.manual_open.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_session_failure(self) -> Self {
        self.shared.fail_session.store(true, Ordering::SeqCst);
        self
    }

    /// Send a hardware event through the most recent open's sink
    pub fn emit(&self, event: HardwareEvent) {
        if let Some(sink) = self.shared.sink.lock().as_ref() {
            sink.send(event);
        }
    }

    pub fn open_calls(&self) -> usize {
        self.shared.open_calls.load(Ordering::SeqCst)
    }

    /// Devices opened and not yet closed
    pub fn open_devices(&self) -> usize {
        self.shared.open_devices.load(Ordering::SeqCst)
    }

    pub fn repeating_active(&self) -> bool {
        self.shared.repeating.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CaptureRequest> {
        self.shared.requests.lock().last().cloned()
    }
}

impl CameraBackend for FakeBackend {
    fn device_ids(&self) -> Result<Vec<String>> {
        Ok(self.shared.devices.iter().map(|c| c.id.clone()).collect())
    }

    fn capabilities(&self, device_id: &str) -> Result<DeviceCapabilities> {
        self.shared
            .devices
            .iter()
            .find(|c| c.id == device_id)
            .cloned()
            .ok_or_else(|| AppError::device(device_id, "no such camera"))
    }

    fn open(&self, device_id: &str, events: EventSink) -> Result<Box<dyn CameraDevice>> {
        self.capabilities(device_id)?;
        self.shared.open_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.open_devices.fetch_add(1, Ordering::SeqCst);
        if !self.shared.manual_open.load(Ordering::SeqCst) {
            events.send(HardwareEvent::Opened);
        }
        *self.shared.sink.lock() = Some(events);
        Ok(Box::new(FakeDevice {
            id: device_id.to_string(),
            shared: self.shared.clone(),
            closed: false,
        }))
    }
}

struct FakeDevice {
    id: String,
    shared: Arc<Shared>,
    closed: bool,
}

impl CameraDevice for FakeDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_session(&mut self, _outputs: &[Arc<Surface>]) -> Result<Box<dyn CaptureSession>> {
        if self.shared.fail_session.load(Ordering::SeqCst) {
            return Err(AppError::device(&self.id, "unsupported output combination"));
        }
        Ok(Box::new(FakeSession {
            shared: self.shared.clone(),
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.open_devices.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct FakeSession {
    shared: Arc<Shared>,
}

impl CaptureSession for FakeSession {
    fn set_repeating(&mut self, request: &CaptureRequest) -> Result<()> {
        self.shared.requests.lock().push(request.clone());
        self.shared.repeating.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_repeating(&mut self) -> Result<()> {
        self.shared.repeating.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.shared.repeating.store(false, Ordering::SeqCst);
    }
}
