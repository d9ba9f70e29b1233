//! External USB cameras through V4L2
//!
//! `UvcSource` runs a blocking mmap capture loop on the tokio blocking pool
//! and pushes every dequeued buffer onto the output surface.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::device::{validate_even, DeviceCapabilities, HardwareLevel};
use super::format::{Facing, FpsRange, PixelFormat, Resolution};
use super::frame::VideoFrame;
use super::source::VideoSource;
use super::surface::Surface;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::error_throttled;

/// Buffers smaller than this are treated as corrupt and dropped
const MIN_FRAME_SIZE: usize = 128;
const BUFFER_COUNT: u32 = 4;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sizes offered for devices that report a stepwise size range
const STEPWISE_CANDIDATES: [Resolution; 4] = [
    Resolution {
        width: 640,
        height: 480,
    },
    Resolution::HD720,
    Resolution::HD1080,
    Resolution {
        width: 3840,
        height: 2160,
    },
];

/// One pixel format and the sizes/rates a device offers for it
#[derive(Debug, Clone)]
pub struct UvcFormat {
    pub format: PixelFormat,
    pub description: String,
    /// (size, frame rates, highest first)
    pub sizes: Vec<(Resolution, Vec<u32>)>,
}

/// A V4L2 capture device
#[derive(Debug, Clone)]
pub struct UvcDeviceInfo {
    pub path: PathBuf,
    pub name: String,
    pub driver: String,
    pub bus_info: String,
    /// Sorted by format preference
    pub formats: Vec<UvcFormat>,
}

impl UvcDeviceInfo {
    /// Query a device node
    pub fn probe(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device = Device::with_path(&path).map_err(|e| device_error(&path, e))?;
        let caps = device.query_caps().map_err(|e| device_error(&path, e))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(AppError::device(
                path.display().to_string(),
                "not a video capture device",
            ));
        }

        let mut formats = Vec::new();
        for desc in device.enum_formats().map_err(|e| device_error(&path, e))? {
            let Some(format) = PixelFormat::from_fourcc(desc.fourcc) else {
                debug!("Skipping format {} ({})", desc.fourcc, desc.description);
                continue;
            };
            formats.push(UvcFormat {
                format,
                description: desc.description,
                sizes: enumerate_sizes(&device, format),
            });
        }
        formats.sort_by(|a, b| b.format.priority().cmp(&a.format.priority()));

        Ok(Self {
            path,
            name: caps.card,
            driver: caps.driver,
            bus_info: caps.bus,
            formats,
        })
    }

    /// Capability view used for geometry validation
    pub fn capabilities(&self) -> DeviceCapabilities {
        let mut resolutions: Vec<Resolution> = self
            .formats
            .iter()
            .flat_map(|f| f.sizes.iter().map(|(r, _)| *r))
            .collect();
        resolutions.sort_by_key(|r| r.pixels());
        resolutions.dedup();

        let mut fps_ranges: Vec<FpsRange> = self
            .formats
            .iter()
            .flat_map(|f| f.sizes.iter().flat_map(|(_, rates)| rates.iter()))
            .map(|fps| FpsRange::fixed(*fps))
            .collect();
        fps_ranges.sort_by_key(|r| r.max);
        fps_ranges.dedup();

        let mut caps = DeviceCapabilities::minimal(
            self.path.display().to_string(),
            Facing::External,
            resolutions,
        );
        caps.hardware_level = HardwareLevel::External;
        caps.fps_ranges = fps_ranges;
        caps
    }

    /// Preferred format offering exactly `resolution`
    pub fn format_for(&self, resolution: Resolution) -> Option<PixelFormat> {
        self.formats
            .iter()
            .find(|f| f.sizes.iter().any(|(r, _)| *r == resolution))
            .map(|f| f.format)
    }
}

fn device_error(path: &Path, e: io::Error) -> AppError {
    AppError::device(path.display().to_string(), e)
}

fn enumerate_sizes(device: &Device, format: PixelFormat) -> Vec<(Resolution, Vec<u32>)> {
    let fourcc = format.to_fourcc();
    let mut sizes = Vec::new();
    match device.enum_framesizes(fourcc) {
        Ok(framesizes) => {
            for size in framesizes {
                match size.size {
                    v4l::framesize::FrameSizeEnum::Discrete(d) => {
                        let rates = enumerate_rates(device, format, d.width, d.height);
                        sizes.push((Resolution::new(d.width, d.height), rates));
                    }
                    v4l::framesize::FrameSizeEnum::Stepwise(s) => {
                        for res in STEPWISE_CANDIDATES {
                            if (s.min_width..=s.max_width).contains(&res.width)
                                && (s.min_height..=s.max_height).contains(&res.height)
                            {
                                let rates = enumerate_rates(device, format, res.width, res.height);
                                sizes.push((res, rates));
                            }
                        }
                    }
                }
            }
        }
        Err(e) => debug!("Failed to enumerate sizes for {}: {}", format, e),
    }
    sizes.sort_by(|a, b| b.0.pixels().cmp(&a.0.pixels()));
    sizes.dedup_by(|a, b| a.0 == b.0);
    sizes
}

fn enumerate_rates(device: &Device, format: PixelFormat, width: u32, height: u32) -> Vec<u32> {
    let mut rates = Vec::new();
    match device.enum_frameintervals(format.to_fourcc(), width, height) {
        Ok(intervals) => {
            for interval in intervals {
                match interval.interval {
                    v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) => {
                        if fraction.numerator > 0 {
                            rates.push(fraction.denominator / fraction.numerator);
                        }
                    }
                    v4l::frameinterval::FrameIntervalEnum::Stepwise(step) => {
                        if step.max.numerator > 0 && step.min.numerator > 0 {
                            rates.push(step.max.denominator / step.max.numerator);
                            rates.push(step.min.denominator / step.min.numerator);
                        }
                    }
                }
            }
        }
        Err(_) => rates.push(30),
    }
    rates.sort_by(|a, b| b.cmp(a));
    rates.dedup();
    rates
}

/// Scan `/dev/video*` for capture devices
pub fn enumerate_devices() -> Result<Vec<UvcDeviceInfo>> {
    let mut devices = Vec::new();
    for entry in std::fs::read_dir("/dev")?.flatten() {
        let path = entry.path();
        let is_video = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("video"));
        if !is_video {
            continue;
        }
        match UvcDeviceInfo::probe(&path) {
            Ok(info) if !info.formats.is_empty() => devices.push(info),
            Ok(_) => debug!("{:?} offers no usable formats", path),
            Err(e) => debug!("Skipping {:?}: {}", path, e),
        }
    }
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    info!("Found {} video capture devices", devices.len());
    Ok(devices)
}

/// Capture loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvcState {
    Stopped,
    Running,
    /// Dequeue timed out; the device is open but delivers nothing
    NoSignal,
    DeviceLost,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct UvcConfig {
    resolution: Resolution,
    format: PixelFormat,
    fps: u32,
}

/// V4L2 capture source
pub struct UvcSource {
    path: PathBuf,
    config: Mutex<Option<UvcConfig>>,
    state: watch::Sender<UvcState>,
    stop_flag: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl UvcSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(UvcState::Stopped);
        Self {
            path: path.into(),
            config: Mutex::new(None),
            state,
            stop_flag: Arc::new(AtomicBool::new(false)),
            frames: Arc::new(AtomicU64::new(0)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> UvcState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<UvcState> {
        self.state.subscribe()
    }

    /// Frames pushed since the source was constructed
    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VideoSource for UvcSource {
    fn create(&self, width: u32, height: u32, fps: u32, rotation: u32) -> Result<()> {
        validate_even(width, height)?;
        if rotation % 360 != 0 {
            return Err(AppError::Configuration(
                "external cameras cannot rotate the output".to_string(),
            ));
        }

        let info = UvcDeviceInfo::probe(&self.path)?;
        let caps = info.capabilities();
        caps.validate_geometry(width, height)?;
        caps.validate_fps(fps)?;

        let resolution = Resolution::new(width, height);
        let format = info.format_for(resolution).ok_or_else(|| {
            AppError::Configuration(format!("{} not offered by {}", resolution, info.name))
        })?;
        debug!("{}: {} {} @ {}fps", info.name, resolution, format, fps);
        *self.config.lock() = Some(UvcConfig {
            resolution,
            format,
            fps,
        });
        Ok(())
    }

    async fn start(&self, surface: Arc<Surface>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let config = (*self.config.lock())
            .ok_or_else(|| AppError::InvalidState("create must be called before start".to_string()))?;

        self.stop_flag.store(false, Ordering::SeqCst);
        let (ready_tx, ready_rx) = oneshot::channel();
        let path = self.path.clone();
        let state = self.state.clone();
        let stop_flag = self.stop_flag.clone();
        let frames = self.frames.clone();

        *task = Some(tokio::task::spawn_blocking(move || {
            let result = run_capture(&path, config, &surface, &state, &stop_flag, &frames, ready_tx);
            match &result {
                Ok(()) => state.send_replace(UvcState::Stopped),
                Err(AppError::Device { .. }) => state.send_replace(UvcState::DeviceLost),
                Err(_) => state.send_replace(UvcState::Error),
            };
            result
        }));

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal("capture thread exited".to_string())),
        }
    }

    async fn stop(&self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Capture ended with error: {}", e),
                Err(e) => error!("Capture task panicked: {}", e),
            }
        }
        self.state.send_replace(UvcState::Stopped);
        Ok(())
    }

    async fn release(&self) {
        let _ = self.stop().await;
        *self.config.lock() = None;
    }

    fn is_running(&self) -> bool {
        matches!(self.state(), UvcState::Running | UvcState::NoSignal)
    }
}

fn is_device_lost(e: &io::Error) -> bool {
    // ENXIO, ENODEV, EIO, EPIPE, ESHUTDOWN
    matches!(e.raw_os_error(), Some(6 | 19 | 5 | 32 | 108))
}

fn run_capture(
    path: &Path,
    config: UvcConfig,
    surface: &Surface,
    state: &watch::Sender<UvcState>,
    stop_flag: &AtomicBool,
    frames: &AtomicU64,
    ready: oneshot::Sender<Result<()>>,
) -> Result<()> {
    let device_name = path.display().to_string();
    let opened = (|| -> Result<(Device, Format)> {
        let device = Device::with_path(path).map_err(|e| device_error(path, e))?;
        let requested = Format::new(
            config.resolution.width,
            config.resolution.height,
            config.format.to_fourcc(),
        );
        let actual = device
            .set_format(&requested)
            .map_err(|e| device_error(path, e))?;
        if actual.width != config.resolution.width || actual.height != config.resolution.height {
            return Err(AppError::Configuration(format!(
                "{} refused {}, offered {}x{}",
                device_name, config.resolution, actual.width, actual.height
            )));
        }
        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("{}: failed to set {}fps: {}", device_name, config.fps, e);
        }
        Ok((device, actual))
    })();

    let (device, format) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let message = e.to_string();
            let _ = ready.send(Err(e));
            return Err(AppError::Internal(message));
        }
    };

    let mut stream = match Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT) {
        Ok(stream) => stream,
        Err(e) => {
            let message = e.to_string();
            let _ = ready.send(Err(device_error(path, e)));
            return Err(AppError::device(device_name, message));
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);

    state.send_replace(UvcState::Running);
    let _ = ready.send(Ok(()));
    info!(
        "Capturing {} {} from {}",
        config.resolution, config.format, device_name
    );

    let throttler = LogThrottler::with_secs(5);
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;

    while !stop_flag.load(Ordering::Relaxed) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if state.send_replace(UvcState::NoSignal) != UvcState::NoSignal {
                    warn!("{}: capture timeout, no signal", device_name);
                }
                continue;
            }
            Err(e) if is_device_lost(&e) => {
                error!("Video device lost: {} - {}", device_name, e);
                return Err(AppError::device(device_name, e));
            }
            Err(e) => {
                error_throttled!(throttler, &format!("{:?}", e.kind()), "Capture error: {}", e);
                continue;
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        if used < MIN_FRAME_SIZE {
            debug!("Dropping short frame: {} bytes", used);
            continue;
        }
        if *state.borrow() != UvcState::Running {
            state.send_replace(UvcState::Running);
        }

        let timestamp_ns = meta.timestamp.sec as i64 * 1_000_000_000 + meta.timestamp.usec as i64 * 1000;
        let frame = VideoFrame::new(
            Bytes::copy_from_slice(&buf[..used]),
            config.resolution,
            config.format,
            format.stride,
            u64::from(meta.sequence),
        )
        .with_sensor_timestamp(timestamp_ns);
        if !frame.has_expected_size() {
            debug!("Dropping truncated {} frame: {} bytes", config.format, used);
            continue;
        }
        surface.push(frame);
        frames.fetch_add(1, Ordering::Relaxed);

        window_frames += 1;
        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(5) {
            debug!(
                "{}: {:.1} fps",
                device_name,
                f64::from(window_frames) / elapsed.as_secs_f64()
            );
            window_frames = 0;
            window_start = Instant::now();
        }
    }

    info!("Capture stopped on {}", device_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> UvcDeviceInfo {
        UvcDeviceInfo {
            path: PathBuf::from("/dev/video9"),
            name: "Test Cam".to_string(),
            driver: "uvcvideo".to_string(),
            bus_info: "usb-0000:00:14.0-1".to_string(),
            formats: vec![
                UvcFormat {
                    format: PixelFormat::Yuyv,
                    description: "YUYV 4:2:2".to_string(),
                    sizes: vec![(Resolution::new(640, 480), vec![30])],
                },
                UvcFormat {
                    format: PixelFormat::Mjpeg,
                    description: "Motion-JPEG".to_string(),
                    sizes: vec![
                        (Resolution::HD1080, vec![30, 15]),
                        (Resolution::new(640, 480), vec![60, 30]),
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_capabilities_are_external_and_exact() {
        let caps = info().capabilities();
        assert_eq!(caps.facing, Facing::External);
        assert!(caps.validate_geometry(1920, 1080).is_ok());
        assert!(caps.validate_geometry(1280, 720).is_err());
        assert_eq!(caps.max_fps(), 60);
    }

    #[test]
    fn test_format_for_prefers_first_listed() {
        let info = info();
        assert_eq!(info.format_for(Resolution::new(640, 480)), Some(PixelFormat::Yuyv));
        assert_eq!(info.format_for(Resolution::HD1080), Some(PixelFormat::Mjpeg));
        assert_eq!(info.format_for(Resolution::HD720), None);
    }

    #[test]
    fn test_device_lost_errno() {
        assert!(is_device_lost(&io::Error::from_raw_os_error(19)));
        assert!(!is_device_lost(&io::Error::from_raw_os_error(11)));
    }

    #[tokio::test]
    async fn test_missing_device_fails_create() {
        let source = UvcSource::new("/dev/video-does-not-exist");
        let err = source.create(640, 480, 30, 0).unwrap_err();
        assert!(matches!(err, AppError::Device { .. }));
        assert!(!source.is_running());
        source.stop().await.unwrap();
    }
}
