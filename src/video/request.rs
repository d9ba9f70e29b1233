//! Repeating capture request
//!
//! A plain value describing every parameter the camera pipeline reissues for
//! each frame. Backends translate it into their native request type; the
//! camera manager keeps one live copy per session and mutates it in place.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::device::{AfMode, FaceDetectMode};
use super::format::{FpsRange, Rect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Auto,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AeMode {
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwbMode {
    Off,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfTrigger {
    Idle,
    Start,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMode {
    Off,
    Torch,
}

/// Per-channel white balance gains (red, green-even, green-odd, blue)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RggbGains {
    pub red: f32,
    pub green_even: f32,
    pub green_odd: f32,
    pub blue: f32,
}

/// Manual color correction, used when AWB is off
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorCorrection {
    pub gains: RggbGains,
    /// Row-major 3x3 color transform
    pub transform: [[f32; 3]; 3],
}

pub const IDENTITY_TRANSFORM: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Metering region with a weight (0 = don't care)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringRect {
    pub rect: Rect,
    pub weight: u32,
}

/// The repeating request submitted to a capture session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Output surfaces the request writes into
    pub targets: Vec<Uuid>,
    pub control_mode: ControlMode,
    pub ae_mode: AeMode,
    pub ae_compensation: i32,
    pub ae_target_fps: FpsRange,
    pub sensor_exposure_time_ns: Option<u64>,
    pub sensor_sensitivity: Option<u32>,
    pub awb_mode: AwbMode,
    pub color_correction: Option<ColorCorrection>,
    pub af_mode: AfMode,
    pub af_trigger: AfTrigger,
    pub af_regions: Vec<MeteringRect>,
    pub lens_focus_distance: Option<f32>,
    /// Native zoom ratio, for devices that support it
    pub zoom_ratio: Option<f32>,
    /// Sensor crop, for devices that emulate zoom
    pub crop_region: Option<Rect>,
    pub video_stabilization: bool,
    pub optical_stabilization: bool,
    pub flash_mode: FlashMode,
    pub face_detect_mode: FaceDetectMode,
}

impl CaptureRequest {
    /// Preview template: everything automatic, fixed fps range
    pub fn preview(targets: Vec<Uuid>, fps: FpsRange) -> Self {
        Self {
            targets,
            control_mode: ControlMode::Auto,
            ae_mode: AeMode::On,
            ae_compensation: 0,
            ae_target_fps: fps,
            sensor_exposure_time_ns: None,
            sensor_sensitivity: None,
            awb_mode: AwbMode::Auto,
            color_correction: None,
            af_mode: AfMode::Off,
            af_trigger: AfTrigger::Idle,
            af_regions: Vec::new(),
            lens_focus_distance: None,
            zoom_ratio: None,
            crop_region: None,
            video_stabilization: false,
            optical_stabilization: false,
            flash_mode: FlashMode::Off,
            face_detect_mode: FaceDetectMode::Off,
        }
    }

    /// Whether manual exposure and auto exposure are both requested
    ///
    /// Never true for a request produced by the control layer.
    pub fn has_exposure_conflict(&self) -> bool {
        self.ae_mode == AeMode::On
            && (self.sensor_exposure_time_ns.is_some() || self.sensor_sensitivity.is_some())
    }
}
