//! Camera capture state machine
//!
//! `CameraManager` owns one camera device and its capture session.
//!
//! ```text
//! Idle ─open─> Preparing ─> Opening ─Opened─> Running
//!   ^                          │                 │
//!   └──────── close ───────────┴──── Closing <───┘
//!                     Error (disconnect / hardware failure) ─close─> Idle
//! ```
//!
//! Hardware callbacks and control requests are funneled into a single worker
//! task, so request mutation never races with session start-up or teardown.
//! Opens are serialized by a one-permit semaphore; `close` is synchronous and
//! may run at any time, including while an open is in flight.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{
    find_by_facing, CameraBackend, CameraDevice, CaptureResult, CaptureSession, EventSink,
    HardwareEvent,
};
use super::controls::{ApplyContext, ManualControl, ManualSettings};
use super::device::{validate_even, DeviceCapabilities};
use super::face::FaceMapper;
use super::format::Resolution;
use super::request::CaptureRequest;
use super::surface::Surface;
use crate::config::CameraConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, FaceInfo, SystemEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Capture session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Opening,
    Running,
    Closing,
    /// Device lost or failed; `close` is required before the next open
    Error(String),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Opening => "opening",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Encoder-facing capture geometry, fixed between prepare and close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfiguration {
    pub resolution: Resolution,
    pub fps: u32,
    pub rotation: u32,
}

/// Notification emitted for every processed control
#[derive(Debug, Clone, PartialEq)]
pub struct ControlApplied {
    pub control: ManualControl,
    /// false when the camera was not running and the value was only stored
    pub live: bool,
}

/// Callback receiving faces mapped into the output surface's coordinates
pub type FaceListener = Arc<dyn Fn(&[FaceInfo]) + Send + Sync>;

struct Core {
    /// Bumped on every open attempt and close; stale hardware events are dropped
    epoch: u64,
    device_id: String,
    caps: DeviceCapabilities,
    config: Option<CaptureConfiguration>,
    surface: Option<Arc<Surface>>,
    image_surface: Option<Arc<Surface>>,
    device: Option<Box<dyn CameraDevice>>,
    session: Option<Box<dyn CaptureSession>>,
    request: Option<CaptureRequest>,
    settings: ManualSettings,
    /// Controls received while the session was being set up
    deferred: VecDeque<ManualControl>,
    pending_open: Option<oneshot::Sender<Result<()>>>,
    /// Last exposure measured while auto exposure was on
    ae_exposure_ns: Option<u64>,
    face_listener: Option<FaceListener>,
}

impl Core {
    fn ev_base_ns(&self, fallback: u64) -> u64 {
        self.settings
            .exposure_time_ns
            .or(self.ae_exposure_ns)
            .unwrap_or(fallback)
    }
}

struct Inner {
    backend: Arc<dyn CameraBackend>,
    core: Mutex<Core>,
    state: watch::Sender<SessionState>,
    applied_tx: broadcast::Sender<ControlApplied>,
    events: RwLock<Option<Arc<EventBus>>>,
    hw_tx: mpsc::UnboundedSender<(u64, HardwareEvent)>,
    cmd_tx: mpsc::UnboundedSender<ManualControl>,
    fallback_exposure_ns: u64,
    throttler: LogThrottler,
}

/// Camera device and capture session owner
pub struct CameraManager {
    inner: Arc<Inner>,
    open_gate: Semaphore,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraManager {
    /// Create a manager for the camera selected by `config`
    ///
    /// Queries the device list and the selected device's capabilities.
    /// Must be called from within a Tokio runtime.
    pub fn new(backend: Arc<dyn CameraBackend>, config: &CameraConfig) -> Result<Self> {
        let device_id = match &config.device {
            Some(id) => id.clone(),
            None => find_by_facing(backend.as_ref(), config.facing)?,
        };
        let caps = backend.capabilities(&device_id)?;
        info!(
            "Camera {} selected ({}, {:?})",
            device_id, caps.facing, caps.hardware_level
        );

        let (hw_tx, hw_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        let (applied_tx, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            backend,
            core: Mutex::new(Core {
                epoch: 0,
                device_id,
                caps,
                config: None,
                surface: None,
                image_surface: None,
                device: None,
                session: None,
                request: None,
                settings: ManualSettings {
                    face_detection: config.face_detection.then_some(true),
                    ..ManualSettings::default()
                },
                deferred: VecDeque::new(),
                pending_open: None,
                ae_exposure_ns: None,
                face_listener: None,
            }),
            state,
            applied_tx,
            events: RwLock::new(None),
            hw_tx,
            cmd_tx,
            fallback_exposure_ns: config.fallback_exposure_ns,
            throttler: LogThrottler::with_secs(5),
        });

        let worker = tokio::spawn(run_worker(inner.clone(), hw_rx, cmd_rx));

        Ok(Self {
            inner,
            open_gate: Semaphore::new(1),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn set_event_bus(&self, events: Arc<EventBus>) {
        *self.inner.events.write() = Some(events);
    }

    /// Store the output configuration and the encoder surface
    ///
    /// Validated against the currently selected device; `open` validates
    /// again against whichever device it opens.
    pub fn prepare(&self, config: CaptureConfiguration, surface: Arc<Surface>) -> Result<()> {
        validate_even(config.resolution.width, config.resolution.height)?;

        let mut core = self.inner.core.lock();
        match self.state() {
            SessionState::Idle => {}
            state => {
                return Err(AppError::InvalidState(format!(
                    "cannot prepare while {}",
                    state
                )))
            }
        }
        core.caps
            .validate_geometry(config.resolution.width, config.resolution.height)?;
        core.caps.validate_fps(config.fps)?;

        debug!(
            "Prepared {} @ {}fps, rotation {}",
            config.resolution, config.fps, config.rotation
        );
        core.config = Some(config);
        core.surface = Some(surface);
        Ok(())
    }

    /// Open `device_id` and start the repeating request
    ///
    /// Resolves once the session is running with every stored setting
    /// reapplied. Calling it for the device that is already running is a
    /// no-op.
    pub async fn open(&self, device_id: &str) -> Result<()> {
        let _permit = self
            .open_gate
            .acquire()
            .await
            .map_err(|_| AppError::Internal("camera open gate closed".to_string()))?;

        let rx = {
            let mut core = self.inner.core.lock();
            match self.state() {
                SessionState::Idle => {}
                SessionState::Running if core.device_id == device_id => return Ok(()),
                state => {
                    return Err(AppError::InvalidState(format!(
                        "cannot open {} while {}",
                        device_id, state
                    )))
                }
            }
            let config = core.config.ok_or_else(|| {
                AppError::InvalidState("prepare must be called before open".to_string())
            })?;

            self.inner.set_state(&core, SessionState::Preparing);
            let caps = match self.inner.backend.capabilities(device_id).and_then(|caps| {
                caps.validate_geometry(config.resolution.width, config.resolution.height)?;
                caps.validate_fps(config.fps)?;
                Ok(caps)
            }) {
                Ok(caps) => caps,
                Err(e) => {
                    self.inner.set_state(&core, SessionState::Idle);
                    return Err(e);
                }
            };

            core.device_id = device_id.to_string();
            core.caps = caps;
            core.epoch += 1;
            let sink = EventSink::new(core.epoch, self.inner.hw_tx.clone());
            let (tx, rx) = oneshot::channel();
            core.pending_open = Some(tx);

            self.inner.set_state(&core, SessionState::Opening);
            info!("Opening camera {}", device_id);
            match self.inner.backend.open(device_id, sink) {
                Ok(device) => core.device = Some(device),
                Err(e) => {
                    let reason = e.to_string();
                    self.inner.fail(&mut core, reason.clone());
                    return Err(AppError::device(device_id, reason));
                }
            }
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::device(device_id, "open abandoned")),
        }
    }

    /// Release the session and the device
    ///
    /// Safe in every state and idempotent. An open still in flight fails.
    /// Stored settings and deferred controls are kept for the next open.
    pub fn close(&self) {
        let mut core = self.inner.core.lock();
        self.inner.close_locked(&mut core);
    }

    /// Close the current device and open another one with the same configuration
    pub async fn switch_device(&self, device_id: &str) -> Result<()> {
        info!("Switching camera to {}", device_id);
        self.close();
        self.open(device_id).await
    }

    /// Queue a manual control
    ///
    /// Validated against the current device, then processed in submission
    /// order: applied live while running, deferred while the session is
    /// being set up, stored otherwise.
    pub fn apply(&self, control: ManualControl) -> Result<()> {
        control.validate(&self.inner.core.lock().caps)?;
        self.inner
            .cmd_tx
            .send(control)
            .map_err(|_| AppError::Internal("camera worker stopped".to_string()))
    }

    /// Attach a secondary still-image output
    ///
    /// A running session is closed and reopened so the new output is part of
    /// the capture session.
    pub async fn add_image_listener(
        &self,
        resolution: Resolution,
        max_images: usize,
    ) -> Result<Arc<Surface>> {
        let surface = Arc::new(Surface::with_depth(resolution, max_images));
        let reopen = self.replace_image_surface(Some(surface.clone()));
        if let Some(device_id) = reopen {
            self.open(&device_id).await?;
        }
        Ok(surface)
    }

    pub async fn remove_image_listener(&self) -> Result<()> {
        if let Some(device_id) = self.replace_image_surface(None) {
            self.open(&device_id).await?;
        }
        Ok(())
    }

    fn replace_image_surface(&self, surface: Option<Arc<Surface>>) -> Option<String> {
        let mut core = self.inner.core.lock();
        let running = self.state() == SessionState::Running;
        if running {
            self.inner.close_locked(&mut core);
        }
        core.image_surface = surface;
        running.then(|| core.device_id.clone())
    }

    pub fn set_face_listener(&self, listener: Option<FaceListener>) {
        self.inner.core.lock().face_listener = listener;
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Subscribe to processed controls
    pub fn subscribe_applied(&self) -> broadcast::Receiver<ControlApplied> {
        self.inner.applied_tx.subscribe()
    }

    pub fn device_id(&self) -> String {
        self.inner.core.lock().device_id.clone()
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.inner.core.lock().caps.clone()
    }

    pub fn settings(&self) -> ManualSettings {
        self.inner.core.lock().settings.clone()
    }

    /// Copy of the live repeating request, if a session is running
    pub fn current_request(&self) -> Option<CaptureRequest> {
        self.inner.core.lock().request.clone()
    }

    pub fn device_ids(&self) -> Result<Vec<String>> {
        self.inner.backend.device_ids()
    }

    /// Capabilities of any camera, not only the selected one
    pub fn device_capabilities(&self, device_id: &str) -> Result<DeviceCapabilities> {
        self.inner.backend.capabilities(device_id)
    }

    /// Change the selected camera without opening it
    pub fn select_device(&self, device_id: &str) -> Result<()> {
        let caps = self.inner.backend.capabilities(device_id)?;
        let mut core = self.inner.core.lock();
        if self.state() != SessionState::Idle {
            return Err(AppError::InvalidState(format!(
                "cannot select {} while {}",
                device_id,
                self.state()
            )));
        }
        if let Some(config) = core.config {
            caps.validate_geometry(config.resolution.width, config.resolution.height)?;
            caps.validate_fps(config.fps)?;
        }
        core.device_id = device_id.to_string();
        core.caps = caps;
        Ok(())
    }

    /// Exposure that EV compensation currently scales
    pub fn exposure_base_ns(&self) -> u64 {
        self.inner
            .core
            .lock()
            .ev_base_ns(self.inner.fallback_exposure_ns)
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.close();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut hw_rx: mpsc::UnboundedReceiver<(u64, HardwareEvent)>,
    mut cmd_rx: mpsc::UnboundedReceiver<ManualControl>,
) {
    loop {
        tokio::select! {
            biased;
            Some((epoch, event)) = hw_rx.recv() => inner.handle_hardware_event(epoch, event),
            Some(control) = cmd_rx.recv() => inner.handle_control(control),
            else => break,
        }
    }
    debug!("Camera worker stopped");
}

impl Inner {
    fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Must be called with the core lock held
    fn set_state(&self, core: &Core, new: SessionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == new {
                return false;
            }
            *current = new.clone();
            true
        });
        if !changed {
            return;
        }

        debug!("Camera {} -> {}", core.device_id, new);
        let reason = match &new {
            SessionState::Error(reason) => Some(reason.clone()),
            _ => None,
        };
        self.publish(SystemEvent::CameraStateChanged {
            device: core.device_id.clone(),
            state: new.name().to_string(),
            reason,
        });
    }

    fn publish(&self, event: SystemEvent) {
        if let Some(events) = self.events.read().as_ref() {
            events.publish(event);
        }
    }

    fn handle_hardware_event(&self, epoch: u64, event: HardwareEvent) {
        let mut core = self.core.lock();
        if epoch != core.epoch {
            debug!("Dropping stale camera event {:?} (epoch {})", event, epoch);
            return;
        }

        match event {
            HardwareEvent::Opened => self.start_session(&mut core),
            HardwareEvent::Disconnected => {
                warn!("Camera {} disconnected", core.device_id);
                self.fail(&mut core, "device disconnected".to_string());
            }
            HardwareEvent::Error(reason) => {
                warn!("Camera {} error: {}", core.device_id, reason);
                self.fail(&mut core, reason);
            }
            HardwareEvent::CaptureCompleted(result) => {
                if let Some((listener, faces)) = self.process_result(&mut core, result) {
                    drop(core);
                    listener(&faces);
                }
            }
        }
    }

    /// Record AE measurements and map faces for the registered listener.
    /// Returns the callback to run once the lock is released.
    fn process_result(
        &self,
        core: &mut Core,
        result: CaptureResult,
    ) -> Option<(FaceListener, Vec<FaceInfo>)> {
        if core.settings.auto_exposure() {
            if let Some(ns) = result.exposure_time_ns {
                core.ae_exposure_ns = Some(ns);
            }
        }

        if result.faces.is_empty() || core.settings.face_detection != Some(true) {
            return None;
        }
        let listener = core.face_listener.clone()?;
        let config = core.config?;
        let mapper = FaceMapper {
            active_array: core.caps.active_array,
            sensor_orientation: core.caps.sensor_orientation,
            facing: core.caps.facing,
            view: config.resolution,
        };
        let faces = mapper.map_all(&result.faces);
        self.publish(SystemEvent::CameraFaces {
            device: core.device_id.clone(),
            faces: faces.clone(),
        });
        Some((listener, faces))
    }

    /// Device opened: configure the session, reapply settings, go live
    fn start_session(&self, core: &mut Core) {
        if self.state() != SessionState::Opening {
            return;
        }
        let (Some(config), Some(surface)) = (core.config, core.surface.clone()) else {
            self.fail(core, "no output surface prepared".to_string());
            return;
        };

        let mut outputs = vec![surface];
        outputs.extend(core.image_surface.clone());

        let Some(device) = core.device.as_mut() else {
            self.fail(core, "device handle missing".to_string());
            return;
        };
        let mut session = match device.create_session(&outputs) {
            Ok(session) => session,
            Err(e) => {
                self.fail(core, format!("session configuration failed: {}", e));
                return;
            }
        };

        let targets = outputs.iter().map(|s| s.id()).collect();
        let mut request = CaptureRequest::preview(targets, core.caps.target_fps_range(config.fps));
        if let Some(mode) = core.caps.preferred_af_mode() {
            request.af_mode = mode;
        }
        let ctx = ApplyContext {
            caps: &core.caps,
            ev_base_ns: core.ev_base_ns(self.fallback_exposure_ns),
        };
        core.settings.apply_to(&mut request, &ctx);

        if let Err(e) = session.set_repeating(&request) {
            session.close();
            self.fail(core, format!("repeating request rejected: {}", e));
            return;
        }

        core.session = Some(session);
        core.request = Some(request);
        self.set_state(core, SessionState::Running);
        info!(
            "Camera {} running at {} @ {}fps",
            core.device_id, config.resolution, config.fps
        );

        while let Some(control) = core.deferred.pop_front() {
            self.apply_live(core, control);
        }
        if let Some(tx) = core.pending_open.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn handle_control(&self, control: ManualControl) {
        let mut core = self.core.lock();
        match self.state() {
            SessionState::Running => self.apply_live(&mut core, control),
            SessionState::Preparing | SessionState::Opening | SessionState::Closing => {
                debug!("Deferring {} until the session is running", control.name());
                core.deferred.push_back(control);
            }
            SessionState::Idle | SessionState::Error(_) => {
                core.settings.merge(&control);
                self.notify_applied(&core, control, false);
            }
        }
    }

    fn apply_live(&self, core: &mut Core, control: ManualControl) {
        core.settings.merge(&control);
        let ev_base_ns = core.ev_base_ns(self.fallback_exposure_ns);

        let Core {
            caps,
            settings,
            request,
            session,
            device_id,
            ..
        } = &mut *core;
        if let (Some(request), Some(session)) = (request.as_mut(), session.as_mut()) {
            let ctx = ApplyContext { caps, ev_base_ns };
            settings.apply_control(request, &control, &ctx);
            let key = format!("repeating:{}", device_id);
            match session.set_repeating(request) {
                Ok(()) => self.throttler.clear(&key),
                Err(e) => warn_throttled!(
                    self.throttler,
                    &key,
                    "Camera {} rejected {} update: {}",
                    device_id,
                    control.name(),
                    e
                ),
            }
        }
        self.notify_applied(core, control, true);
    }

    fn notify_applied(&self, core: &Core, control: ManualControl, live: bool) {
        debug!("Control {}={} (live: {})", control.name(), control, live);
        let _ = self.applied_tx.send(ControlApplied { control, live });
        self.publish(SystemEvent::CameraControlApplied {
            device: core.device_id.clone(),
            control: control.name().to_string(),
            value: control.to_string(),
            live,
        });
    }

    /// Tear everything down and enter `Error`
    fn fail(&self, core: &mut Core, reason: String) {
        core.epoch += 1;
        self.release(core);
        self.store_deferred(core);
        if let Some(tx) = core.pending_open.take() {
            let _ = tx.send(Err(AppError::device(core.device_id.clone(), &reason)));
        }
        self.set_state(core, SessionState::Error(reason));
    }

    /// Deferred controls outlive the session they were waiting for
    fn store_deferred(&self, core: &mut Core) {
        while let Some(control) = core.deferred.pop_front() {
            core.settings.merge(&control);
            self.notify_applied(core, control, false);
        }
    }

    fn close_locked(&self, core: &mut Core) {
        core.epoch += 1;
        if self.state() != SessionState::Idle {
            self.set_state(core, SessionState::Closing);
        }
        self.release(core);
        self.store_deferred(core);
        if let Some(tx) = core.pending_open.take() {
            let _ = tx.send(Err(AppError::device(
                core.device_id.clone(),
                "closed while opening",
            )));
        }
        self.set_state(core, SessionState::Idle);
    }

    /// Session first, then device
    fn release(&self, core: &mut Core) {
        if let Some(mut session) = core.session.take() {
            if let Err(e) = session.stop_repeating() {
                debug!("stop_repeating on {}: {}", core.device_id, e);
            }
            session.close();
        }
        core.request = None;
        if let Some(mut device) = core.device.take() {
            device.close();
            info!("Camera {} closed", core.device_id);
        }
    }
}
