//! Camera capability model and geometry validation
//!
//! `DeviceCapabilities` is the immutable snapshot queried from a backend for
//! one device. It is re-queried on every open; everything that decides
//! whether a configuration or a control is acceptable reads from it.

use serde::{Deserialize, Serialize};

use super::format::{Facing, FpsRange, Range, Rect, Resolution};
use crate::error::{AppError, Result};

/// Upper bound applied to the repeating request's fps range
pub const MAX_TARGET_FPS: u32 = 60;

/// How much of the camera pipeline the hardware implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareLevel {
    /// Old HAL; only exact output sizes, no native zoom ratio
    Legacy,
    Limited,
    Full,
    Level3,
    /// USB/V4L2 devices with a discrete size list
    External,
}

impl HardwareLevel {
    /// Whether an output size must match a supported size exactly
    pub fn requires_exact_size(&self) -> bool {
        matches!(self, HardwareLevel::Legacy | HardwareLevel::External)
    }
}

/// Auto-focus modes a device can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfMode {
    Off,
    Auto,
    Macro,
    ContinuousVideo,
    ContinuousPicture,
    Edof,
}

/// Face detection modes, ordered from least to most capable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceDetectMode {
    Off,
    Simple,
    Full,
}

/// Capability set of one camera device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub id: String,
    pub facing: Facing,
    pub hardware_level: HardwareLevel,
    /// Output sizes supported for the encoder surface
    pub resolutions: Vec<Resolution>,
    pub fps_ranges: Vec<FpsRange>,
    pub iso_range: Option<Range<u32>>,
    pub exposure_time_range: Option<Range<u64>>,
    /// Exposure compensation range in EV steps
    pub ev_range: Option<Range<i32>>,
    /// Size of one EV step as a fraction (usually 1/3 or 1/2)
    pub ev_step: f32,
    /// Native zoom ratio range, when the device supports zoom ratios
    pub zoom_ratio_range: Option<Range<f32>>,
    pub max_digital_zoom: f32,
    /// Sensor region eligible for cropping
    pub active_array: Rect,
    /// Clockwise rotation of the sensor relative to the device's natural orientation
    pub sensor_orientation: u32,
    pub flash_available: bool,
    pub video_stabilization: bool,
    pub optical_stabilization: bool,
    pub af_modes: Vec<AfMode>,
    pub face_detect_modes: Vec<FaceDetectMode>,
    pub max_face_count: u32,
    pub min_focus_distance: f32,
}

impl DeviceCapabilities {
    /// A camera that reports nothing beyond its output sizes
    pub fn minimal(id: impl Into<String>, facing: Facing, resolutions: Vec<Resolution>) -> Self {
        let active = resolutions
            .iter()
            .max_by_key(|r| r.pixels())
            .copied()
            .unwrap_or(Resolution::HD1080);
        Self {
            id: id.into(),
            facing,
            hardware_level: HardwareLevel::Limited,
            resolutions,
            fps_ranges: vec![FpsRange::new(15, 30), FpsRange::fixed(30)],
            iso_range: None,
            exposure_time_range: None,
            ev_range: None,
            ev_step: 1.0,
            zoom_ratio_range: None,
            max_digital_zoom: 1.0,
            active_array: Rect::new(0, 0, active.width as i32, active.height as i32),
            sensor_orientation: 0,
            flash_available: false,
            video_stabilization: false,
            optical_stabilization: false,
            af_modes: vec![AfMode::Off],
            face_detect_modes: vec![FaceDetectMode::Off],
            max_face_count: 0,
            min_focus_distance: 0.0,
        }
    }

    /// Whether zoom is applied through a native zoom ratio rather than a crop region
    pub fn native_zoom(&self) -> bool {
        self.zoom_ratio_range.is_some() && self.hardware_level != HardwareLevel::Legacy
    }

    /// Effective zoom range: native ratio range, else 1..max digital zoom
    pub fn zoom_range(&self) -> Range<f32> {
        match self.zoom_ratio_range {
            Some(range) if self.native_zoom() => range,
            _ => Range::new(1.0, self.max_digital_zoom.max(1.0)),
        }
    }

    /// Smallest and largest supported output size, as a bounding box
    pub fn size_bounds(&self) -> Option<(Resolution, Resolution)> {
        let first = self.resolutions.first()?;
        let (mut min, mut max) = (*first, *first);
        for r in &self.resolutions {
            min.width = min.width.min(r.width);
            min.height = min.height.min(r.height);
            max.width = max.width.max(r.width);
            max.height = max.height.max(r.height);
        }
        Some((min, max))
    }

    /// Highest fps any range reaches
    pub fn max_fps(&self) -> u32 {
        self.fps_ranges.iter().map(|r| r.max).max().unwrap_or(30)
    }

    /// Fixed fps range used for the repeating request
    pub fn target_fps_range(&self, fps: u32) -> FpsRange {
        FpsRange::fixed(fps.min(self.max_fps()).min(MAX_TARGET_FPS).max(1))
    }

    /// Best face detect mode the device supports
    pub fn max_face_detect_mode(&self) -> FaceDetectMode {
        if self.max_face_count == 0 {
            return FaceDetectMode::Off;
        }
        self.face_detect_modes
            .iter()
            .copied()
            .max()
            .unwrap_or(FaceDetectMode::Off)
    }

    /// Auto-focus mode picked when autofocus is enabled
    pub fn preferred_af_mode(&self) -> Option<AfMode> {
        [AfMode::ContinuousVideo, AfMode::ContinuousPicture, AfMode::Auto]
            .into_iter()
            .find(|m| self.af_modes.contains(m))
            .or_else(|| self.af_modes.iter().copied().find(|m| *m != AfMode::Off))
    }

    pub fn supports_af_off(&self) -> bool {
        self.af_modes.contains(&AfMode::Off)
    }

    /// Validate an output geometry against this device
    ///
    /// Both dimensions must be even. Legacy and external devices need an
    /// exact size match; everything else accepts sizes inside the bounding
    /// box of the supported sizes.
    pub fn validate_geometry(&self, width: u32, height: u32) -> Result<()> {
        validate_even(width, height)?;

        let requested = Resolution::new(width, height);
        if self.hardware_level.requires_exact_size() {
            if !self.resolutions.contains(&requested) {
                return Err(AppError::Configuration(format!(
                    "{} is not an output size of {} ({:?} hardware)",
                    requested, self.id, self.hardware_level
                )));
            }
            return Ok(());
        }

        let (min, max) = self.size_bounds().ok_or_else(|| {
            AppError::Configuration(format!("{} reports no output sizes", self.id))
        })?;
        if width < min.width || height < min.height || width > max.width || height > max.height {
            return Err(AppError::Configuration(format!(
                "{} outside supported range {}..{} of {}",
                requested, min, max, self.id
            )));
        }
        Ok(())
    }

    /// Validate a requested frame rate
    pub fn validate_fps(&self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(AppError::Configuration("fps must be positive".to_string()));
        }
        if !self.fps_ranges.is_empty() && !self.fps_ranges.iter().any(|r| fps <= r.max) {
            return Err(AppError::Configuration(format!(
                "{} fps exceeds the maximum of {} for {}",
                fps,
                self.max_fps(),
                self.id
            )));
        }
        Ok(())
    }
}

/// Reject odd dimensions
pub fn validate_even(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(AppError::Configuration(format!(
            "invalid size {}x{}",
            width, height
        )));
    }
    if !Resolution::new(width, height).is_even() {
        return Err(AppError::Configuration(format!(
            "size {}x{} must have even dimensions",
            width, height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(level: HardwareLevel) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::minimal(
            "0",
            Facing::Back,
            vec![
                Resolution::new(640, 480),
                Resolution::HD720,
                Resolution::HD1080,
                Resolution::new(3840, 2160),
            ],
        );
        caps.hardware_level = level;
        caps
    }

    #[test]
    fn test_even_sizes_in_bounding_box_accepted() {
        let caps = caps(HardwareLevel::Full);
        for w in (640..=3840).step_by(194) {
            for h in (480..=2160).step_by(142) {
                assert!(caps.validate_geometry(w, h).is_ok(), "{}x{}", w, h);
            }
        }
    }

    #[test]
    fn test_odd_sizes_rejected() {
        let caps = caps(HardwareLevel::Full);
        for (w, h) in [(1921, 1080), (1920, 1079), (641, 481), (1, 2)] {
            let err = caps.validate_geometry(w, h).unwrap_err();
            assert!(matches!(err, AppError::Configuration(_)));
        }
    }

    #[test]
    fn test_outside_bounding_box_rejected() {
        let caps = caps(HardwareLevel::Full);
        assert!(caps.validate_geometry(320, 240).is_err());
        assert!(caps.validate_geometry(4096, 2160).is_err());
    }

    #[test]
    fn test_legacy_requires_exact_match() {
        let caps = caps(HardwareLevel::Legacy);
        assert!(caps.validate_geometry(1280, 720).is_ok());
        assert!(caps.validate_geometry(1280, 960).is_err());
    }

    #[test]
    fn test_zoom_range() {
        let mut caps = caps(HardwareLevel::Full);
        caps.max_digital_zoom = 4.0;
        assert!(!caps.native_zoom());
        assert_eq!(caps.zoom_range(), Range::new(1.0, 4.0));

        caps.zoom_ratio_range = Some(Range::new(0.6, 10.0));
        assert!(caps.native_zoom());
        assert_eq!(caps.zoom_range(), Range::new(0.6, 10.0));

        caps.hardware_level = HardwareLevel::Legacy;
        assert!(!caps.native_zoom());
    }

    #[test]
    fn test_target_fps_range_clamped() {
        let mut caps = caps(HardwareLevel::Full);
        caps.fps_ranges = vec![FpsRange::new(15, 120)];
        assert_eq!(caps.target_fps_range(240), FpsRange::fixed(60));
        assert_eq!(caps.target_fps_range(25), FpsRange::fixed(25));
    }

    #[test]
    fn test_preferred_af_mode() {
        let mut caps = caps(HardwareLevel::Full);
        caps.af_modes = vec![AfMode::Off, AfMode::Auto, AfMode::ContinuousPicture];
        assert_eq!(caps.preferred_af_mode(), Some(AfMode::ContinuousPicture));
        caps.af_modes = vec![AfMode::Off, AfMode::Macro];
        assert_eq!(caps.preferred_af_mode(), Some(AfMode::Macro));
        caps.af_modes = vec![AfMode::Off];
        assert_eq!(caps.preferred_af_mode(), None);
    }
}
