//! Video sources
//!
//! A `VideoSource` turns hardware into frames on a [`Surface`]. The lifecycle
//! is the same for every source:
//!
//! 1. `create` fixes the output geometry (validation only, no hardware)
//! 2. `start` acquires the hardware and begins writing into the surface
//! 3. `stop` releases the hardware; the geometry and any manual settings stay
//! 4. `release` drops everything
//!
//! `start` and `stop` are idempotent.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::camera::{CameraManager, CaptureConfiguration, ControlApplied, SessionState};
use super::controls::{Focus, ManualControl, ManualSettings, SettingKind, WhiteBalance};
use super::device::DeviceCapabilities;
use super::format::Resolution;
use super::surface::Surface;
use crate::error::{AppError, Result};

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Fix the output geometry. Fails with `Configuration` for odd or
    /// unsupported sizes.
    fn create(&self, width: u32, height: u32, fps: u32, rotation: u32) -> Result<()>;

    /// Acquire the hardware and start writing frames into `surface`
    async fn start(&self, surface: Arc<Surface>) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Stop and forget the geometry
    async fn release(&self);

    /// Whether the hardware is currently producing frames
    fn is_running(&self) -> bool;
}

/// Source backed by a platform camera
pub struct CameraSource {
    camera: Arc<CameraManager>,
    config: Mutex<Option<CaptureConfiguration>>,
}

impl CameraSource {
    pub fn new(camera: Arc<CameraManager>) -> Self {
        Self {
            camera,
            config: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &Arc<CameraManager> {
        &self.camera
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.camera.capabilities()
    }

    pub fn settings(&self) -> ManualSettings {
        self.camera.settings()
    }

    pub fn subscribe_applied(&self) -> tokio::sync::broadcast::Receiver<ControlApplied> {
        self.camera.subscribe_applied()
    }

    pub fn apply(&self, control: ManualControl) -> Result<()> {
        self.camera.apply(control)
    }

    /// Auto exposure on clears every manual exposure value; off pins the
    /// exposure time to the last auto-exposure measurement
    pub fn set_auto_exposure(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.apply(ManualControl::Reset(SettingKind::Exposure))
        } else {
            self.apply(ManualControl::ExposureTime(self.camera.exposure_base_ns()))
        }
    }

    pub fn set_iso(&self, iso: u32) -> Result<()> {
        self.apply(ManualControl::Iso(iso))
    }

    pub fn set_exposure_time(&self, ns: u64) -> Result<()> {
        self.apply(ManualControl::ExposureTime(ns))
    }

    pub fn set_exposure_compensation(&self, ev: i32) -> Result<()> {
        self.apply(ManualControl::ExposureCompensation(ev))
    }

    pub fn set_white_balance(&self, kelvin: Option<u32>) -> Result<()> {
        let wb = match kelvin {
            Some(kelvin) => WhiteBalance::Manual { kelvin },
            None => WhiteBalance::Auto,
        };
        self.apply(ManualControl::WhiteBalance(wb))
    }

    pub fn set_zoom(&self, ratio: f32) -> Result<()> {
        self.apply(ManualControl::Zoom(ratio))
    }

    pub fn set_autofocus(&self, enabled: bool) -> Result<()> {
        let focus = if enabled { Focus::Auto } else { Focus::Off };
        self.apply(ManualControl::Focus(focus))
    }

    pub fn focus_at(&self, x: i32, y: i32) -> Result<()> {
        self.apply(ManualControl::FocusAt { x, y })
    }

    pub fn set_torch(&self, enabled: bool) -> Result<()> {
        self.apply(ManualControl::Torch(enabled))
    }

    /// Move to the camera facing the other way, keeping geometry and settings
    pub async fn switch_camera(&self) -> Result<()> {
        let current = self.camera.capabilities();
        let target = current.facing.flipped();

        let mut found = None;
        for id in self.camera.device_ids()? {
            if id == current.id {
                continue;
            }
            if self.camera.device_capabilities(&id)?.facing == target {
                found = Some(id);
                break;
            }
        }
        let id = found.ok_or_else(|| {
            AppError::Configuration(format!("no {} camera available", target))
        })?;

        if self.camera.is_running() {
            self.camera.switch_device(&id).await
        } else {
            self.camera.select_device(&id)
        }
    }
}

#[async_trait]
impl VideoSource for CameraSource {
    fn create(&self, width: u32, height: u32, fps: u32, rotation: u32) -> Result<()> {
        let caps = self.camera.capabilities();
        caps.validate_geometry(width, height)?;
        caps.validate_fps(fps)?;

        *self.config.lock() = Some(CaptureConfiguration {
            resolution: Resolution::new(width, height),
            fps,
            rotation,
        });
        debug!("Camera source created: {}x{} @ {}fps", width, height, fps);
        Ok(())
    }

    async fn start(&self, surface: Arc<Surface>) -> Result<()> {
        // Another start may be mid-open; its outcome decides this one
        let mut state = self.camera.state_watch();
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                SessionState::Running => return Ok(()),
                SessionState::Preparing | SessionState::Opening => {
                    state.changed().await.map_err(|_| {
                        AppError::Internal("camera state channel closed".to_string())
                    })?;
                }
                _ => break,
            }
        }
        let config = (*self.config.lock())
            .ok_or_else(|| AppError::InvalidState("create must be called before start".to_string()))?;

        if let SessionState::Error(reason) = self.camera.state() {
            info!("Recovering camera after error: {}", reason);
            self.camera.close();
        }
        self.camera.prepare(config, surface)?;
        let device_id = self.camera.device_id();
        self.camera.open(&device_id).await
    }

    async fn stop(&self) -> Result<()> {
        self.camera.close();
        Ok(())
    }

    async fn release(&self) {
        self.camera.close();
        *self.config.lock() = None;
    }

    fn is_running(&self) -> bool {
        self.camera.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;
    use crate::video::format::Facing;
    use crate::video::testing::{test_caps, FakeBackend};

    fn source(backend: &FakeBackend) -> CameraSource {
        let camera = CameraManager::new(Arc::new(backend.clone()), &CameraConfig::default()).unwrap();
        CameraSource::new(Arc::new(camera))
    }

    #[tokio::test]
    async fn test_create_validates_without_hardware() {
        let backend = FakeBackend::new(vec![test_caps("0")]);
        let source = source(&backend);

        assert!(source.create(1921, 1080, 30, 0).is_err());
        assert!(source.create(1280, 960, 30, 0).is_err());
        source.create(1280, 720, 30, 0).unwrap();
        assert_eq!(backend.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let backend = FakeBackend::new(vec![test_caps("0")]);
        let source = source(&backend);
        source.create(1280, 720, 30, 0).unwrap();
        let surface = Arc::new(Surface::new(Resolution::HD720));

        source.start(surface.clone()).await.unwrap();
        source.start(surface.clone()).await.unwrap();
        assert!(source.is_running());
        assert_eq!(backend.open_calls(), 1);

        source.stop().await.unwrap();
        source.stop().await.unwrap();
        assert!(!source.is_running());

        source.start(surface).await.unwrap();
        assert!(source.is_running());
    }

    #[tokio::test]
    async fn test_start_while_opening_joins_the_open() {
        let backend = FakeBackend::new(vec![test_caps("0")]).with_manual_open();
        let source = Arc::new(source(&backend));
        source.create(1280, 720, 30, 0).unwrap();
        let surface = Arc::new(Surface::new(Resolution::HD720));

        let first = {
            let (source, surface) = (source.clone(), surface.clone());
            tokio::spawn(async move { source.start(surface).await })
        };
        let mut state = source.camera().state_watch();
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            state.wait_for(|s| *s == SessionState::Opening),
        )
        .await
        .unwrap()
        .unwrap();

        let second = {
            let source = source.clone();
            tokio::spawn(async move { source.start(surface).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        backend.emit(crate::video::backend::HardwareEvent::Opened);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert!(source.is_running());
        assert_eq!(backend.open_calls(), 1);
    }

    #[tokio::test]
    async fn test_start_requires_create() {
        let backend = FakeBackend::new(vec![test_caps("0")]);
        let source = source(&backend);
        let err = source
            .start(Arc::new(Surface::new(Resolution::HD720)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_settings_survive_stop() {
        let backend = FakeBackend::new(vec![test_caps("0")]);
        let source = source(&backend);
        source.create(1920, 1080, 30, 0).unwrap();

        let mut rx = source.subscribe_applied();
        source.set_iso(400).unwrap();
        rx.recv().await.unwrap();

        source
            .start(Arc::new(Surface::new(Resolution::HD1080)))
            .await
            .unwrap();
        source.stop().await.unwrap();
        assert_eq!(source.settings().iso, Some(400));
    }

    #[tokio::test]
    async fn test_control_surface_drives_live_request() {
        use crate::video::device::AfMode;
        use crate::video::request::{AeMode, AwbMode, FlashMode};

        let backend = FakeBackend::new(vec![test_caps("0")]);
        let source = source(&backend);
        source.create(1920, 1080, 30, 0).unwrap();
        source
            .start(Arc::new(Surface::new(Resolution::HD1080)))
            .await
            .unwrap();

        let mut rx = source.subscribe_applied();
        source.set_auto_exposure(false).unwrap();
        source.set_exposure_compensation(1).unwrap();
        source.set_white_balance(Some(5000)).unwrap();
        source.set_zoom(2.0).unwrap();
        source.set_torch(true).unwrap();
        source.set_autofocus(false).unwrap();
        for _ in 0..6 {
            assert!(rx.recv().await.unwrap().live);
        }

        // No AE measurement yet, so manual exposure starts from the fallback base
        assert_eq!(source.settings().exposure_time_ns, Some(16_666_667));
        let request = source.camera().current_request().unwrap();
        assert_eq!(request.ae_mode, AeMode::Off);
        assert_eq!(request.sensor_exposure_time_ns, Some(33_333_334));
        assert_eq!(request.awb_mode, AwbMode::Off);
        assert_eq!(request.flash_mode, FlashMode::Torch);
        assert_eq!(request.af_mode, AfMode::Off);
        assert!(request.crop_region.is_some());

        source.set_auto_exposure(true).unwrap();
        source.set_white_balance(None).unwrap();
        source.set_exposure_time(5_000_000).unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        let settings = source.settings();
        assert_eq!(settings.exposure_compensation, None);
        assert_eq!(settings.exposure_time_ns, Some(5_000_000));
        let request = source.camera().current_request().unwrap();
        assert_eq!(request.awb_mode, AwbMode::Auto);
        assert_eq!(request.sensor_exposure_time_ns, Some(5_000_000));
        assert!(!request.has_exposure_conflict());
    }

    #[tokio::test]
    async fn test_switch_camera_while_stopped() {
        let mut front = test_caps("1");
        front.facing = Facing::Front;
        let backend = FakeBackend::new(vec![test_caps("0"), front]);
        let source = source(&backend);

        source.switch_camera().await.unwrap();
        assert_eq!(source.capabilities().facing, Facing::Front);
        assert_eq!(backend.open_calls(), 0);

        source.switch_camera().await.unwrap();
        assert_eq!(source.capabilities().id, "0");
    }
}
