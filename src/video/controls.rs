//! Manual imaging controls
//!
//! `ManualSettings` is the set of values the user pinned (everything `None`
//! is automatic). It is owned by the camera source, survives close/reopen and
//! is only cleared through [`ManualControl::Reset`].
//!
//! All request mutation lives here as pure functions over
//! [`CaptureRequest`], so the control logic can be tested without hardware.
//! The exposure group is always applied in the order exposure time → ISO →
//! exposure compensation, then white balance, so a later step never
//! reverts an earlier one.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::device::{AfMode, DeviceCapabilities, FaceDetectMode};
use super::format::{round_even, Rect};
use super::request::{
    AeMode, AfTrigger, AwbMode, CaptureRequest, ColorCorrection, ControlMode, FlashMode,
    MeteringRect, RggbGains, IDENTITY_TRANSFORM,
};
use crate::error::{AppError, Result};

/// Coldest and warmest temperatures accepted for manual white balance
pub const MIN_KELVIN: u32 = 2000;
pub const MAX_KELVIN: u32 = 8000;

/// Half size of the tap-to-focus metering square, in sensor pixels
pub const TAP_FOCUS_HALF_SIZE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WhiteBalance {
    Auto,
    Manual { kelvin: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "distance", rename_all = "snake_case")]
pub enum Focus {
    /// Best available auto-focus mode
    Auto,
    /// Auto-focus off, lens left where it is
    Off,
    /// Auto-focus off, lens at the given distance in diopters
    Distance(f32),
}

/// Which stored setting a reset clears
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKind {
    /// Exposure time, ISO and compensation together (back to auto exposure)
    Exposure,
    ExposureTime,
    Iso,
    ExposureCompensation,
    WhiteBalance,
    Zoom,
    Focus,
    Stabilization,
    OpticalStabilization,
    Torch,
    FaceDetection,
    All,
}

/// One control mutation, as issued by a UI or CLI
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", content = "value", rename_all = "snake_case")]
pub enum ManualControl {
    ExposureTime(u64),
    Iso(u32),
    /// EV steps, applied as a 2^ev multiplier on the base exposure time
    ExposureCompensation(i32),
    WhiteBalance(WhiteBalance),
    Zoom(f32),
    Focus(Focus),
    /// One-shot focus on a point in sensor coordinates; not stored
    FocusAt { x: i32, y: i32 },
    Stabilization(bool),
    OpticalStabilization(bool),
    Torch(bool),
    FaceDetection(bool),
    Reset(SettingKind),
}

impl ManualControl {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExposureTime(_) => "exposure_time",
            Self::Iso(_) => "iso",
            Self::ExposureCompensation(_) => "exposure_compensation",
            Self::WhiteBalance(_) => "white_balance",
            Self::Zoom(_) => "zoom",
            Self::Focus(_) => "focus",
            Self::FocusAt { .. } => "focus_at",
            Self::Stabilization(_) => "stabilization",
            Self::OpticalStabilization(_) => "optical_stabilization",
            Self::Torch(_) => "torch",
            Self::FaceDetection(_) => "face_detection",
            Self::Reset(_) => "reset",
        }
    }

    /// Controls that touch AE state and must go through the exposure group
    fn is_exposure(&self) -> bool {
        matches!(
            self,
            Self::ExposureTime(_)
                | Self::Iso(_)
                | Self::ExposureCompensation(_)
                | Self::Reset(
                    SettingKind::Exposure
                        | SettingKind::ExposureTime
                        | SettingKind::Iso
                        | SettingKind::ExposureCompensation
                )
        )
    }

    /// Check a control against the device before it is queued
    pub fn validate(&self, caps: &DeviceCapabilities) -> Result<()> {
        let unsupported = |what: &str| {
            Err(AppError::Configuration(format!(
                "{} is not supported by camera {}",
                what, caps.id
            )))
        };

        match *self {
            Self::ExposureTime(ns) => {
                if caps.exposure_time_range.is_none() {
                    return unsupported("manual exposure time");
                }
                if ns == 0 {
                    return Err(AppError::Configuration(
                        "exposure time must be positive".to_string(),
                    ));
                }
            }
            Self::Iso(_) if caps.iso_range.is_none() => return unsupported("manual ISO"),
            Self::ExposureCompensation(_) if caps.ev_range.is_none() => {
                return unsupported("exposure compensation")
            }
            Self::Zoom(ratio) if !ratio.is_finite() || ratio <= 0.0 => {
                return Err(AppError::Configuration(format!(
                    "invalid zoom ratio {}",
                    ratio
                )))
            }
            Self::Focus(Focus::Auto) if caps.preferred_af_mode().is_none() => {
                return unsupported("autofocus")
            }
            Self::Focus(Focus::Off | Focus::Distance(_)) if !caps.supports_af_off() => {
                return unsupported("manual focus")
            }
            Self::FocusAt { .. } if !caps.af_modes.contains(&AfMode::Auto) => {
                return unsupported("tap to focus")
            }
            Self::Stabilization(true) if !caps.video_stabilization => {
                return unsupported("video stabilization")
            }
            Self::OpticalStabilization(true) if !caps.optical_stabilization => {
                return unsupported("optical stabilization")
            }
            Self::Torch(true) if !caps.flash_available => return unsupported("torch"),
            Self::FaceDetection(true) if caps.max_face_detect_mode() == FaceDetectMode::Off => {
                return unsupported("face detection")
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for ManualControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExposureTime(ns) => write!(f, "{}ns", ns),
            Self::Iso(iso) => write!(f, "{}", iso),
            Self::ExposureCompensation(ev) => write!(f, "{:+}EV", ev),
            Self::WhiteBalance(WhiteBalance::Auto) => write!(f, "auto"),
            Self::WhiteBalance(WhiteBalance::Manual { kelvin }) => write!(f, "{}K", kelvin),
            Self::Zoom(ratio) => write!(f, "{:.2}x", ratio),
            Self::Focus(Focus::Auto) => write!(f, "auto"),
            Self::Focus(Focus::Off) => write!(f, "off"),
            Self::Focus(Focus::Distance(d)) => write!(f, "{:.2}", d),
            Self::FocusAt { x, y } => write!(f, "{},{}", x, y),
            Self::Stabilization(on)
            | Self::OpticalStabilization(on)
            | Self::Torch(on)
            | Self::FaceDetection(on) => write!(f, "{}", if *on { "on" } else { "off" }),
            Self::Reset(kind) => write!(f, "{:?}", kind),
        }
    }
}

/// User-pinned control values; `None` means automatic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualSettings {
    pub exposure_time_ns: Option<u64>,
    pub iso: Option<u32>,
    pub exposure_compensation: Option<i32>,
    pub white_balance: Option<WhiteBalance>,
    pub zoom: Option<f32>,
    pub focus: Option<Focus>,
    pub stabilization: Option<bool>,
    pub optical_stabilization: Option<bool>,
    pub torch: Option<bool>,
    pub face_detection: Option<bool>,
}

/// Device facts a control needs besides the settings themselves
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub caps: &'a DeviceCapabilities,
    /// Base exposure for EV when no manual exposure time is pinned
    pub ev_base_ns: u64,
}

impl ManualSettings {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Record a control. One-shot controls leave the settings unchanged.
    pub fn merge(&mut self, control: &ManualControl) {
        match *control {
            ManualControl::ExposureTime(ns) => self.exposure_time_ns = Some(ns),
            ManualControl::Iso(iso) => self.iso = Some(iso),
            ManualControl::ExposureCompensation(ev) => self.exposure_compensation = Some(ev),
            ManualControl::WhiteBalance(wb) => self.white_balance = Some(wb),
            ManualControl::Zoom(ratio) => self.zoom = Some(ratio),
            ManualControl::Focus(focus) => self.focus = Some(focus),
            ManualControl::FocusAt { .. } => {}
            ManualControl::Stabilization(on) => self.stabilization = Some(on),
            ManualControl::OpticalStabilization(on) => self.optical_stabilization = Some(on),
            ManualControl::Torch(on) => self.torch = Some(on),
            ManualControl::FaceDetection(on) => self.face_detection = Some(on),
            ManualControl::Reset(kind) => self.reset(kind),
        }
    }

    pub fn reset(&mut self, kind: SettingKind) {
        match kind {
            SettingKind::Exposure => {
                self.exposure_time_ns = None;
                self.iso = None;
                self.exposure_compensation = None;
            }
            SettingKind::ExposureTime => self.exposure_time_ns = None,
            SettingKind::Iso => self.iso = None,
            SettingKind::ExposureCompensation => self.exposure_compensation = None,
            SettingKind::WhiteBalance => self.white_balance = None,
            SettingKind::Zoom => self.zoom = None,
            SettingKind::Focus => self.focus = None,
            SettingKind::Stabilization => self.stabilization = None,
            SettingKind::OpticalStabilization => self.optical_stabilization = None,
            SettingKind::Torch => self.torch = None,
            SettingKind::FaceDetection => self.face_detection = None,
            SettingKind::All => *self = Self::default(),
        }
    }

    /// Whether auto exposure is running, so AE measurements are meaningful
    pub fn auto_exposure(&self) -> bool {
        self.exposure_time_ns.is_none() && self.iso.is_none() && self.exposure_compensation.is_none()
    }

    /// Exposure time the request ends up with, if exposure is manual
    pub fn effective_exposure_ns(&self, ctx: &ApplyContext<'_>) -> Option<u64> {
        match (self.exposure_time_ns, self.exposure_compensation) {
            (Some(base), ev) => Some(scale_exposure(base, ev.unwrap_or(0), ctx)),
            (None, Some(ev)) => Some(scale_exposure(ctx.ev_base_ns, ev, ctx)),
            (None, None) => None,
        }
    }

    /// Replay every setting onto `request` in the fixed order
    pub fn apply_to(&self, request: &mut CaptureRequest, ctx: &ApplyContext<'_>) {
        self.apply_exposure(request, ctx);
        self.apply_white_balance(request);
        self.apply_zoom(request, ctx.caps);
        self.apply_focus(request, ctx.caps);
        request.video_stabilization = self.stabilization.unwrap_or(false);
        request.optical_stabilization = self.optical_stabilization.unwrap_or(false);
        self.apply_torch(request, ctx.caps);
        self.apply_face_detection(request, ctx.caps);
    }

    /// Apply one control that has already been merged into `self`
    pub fn apply_control(
        &self,
        request: &mut CaptureRequest,
        control: &ManualControl,
        ctx: &ApplyContext<'_>,
    ) {
        if control.is_exposure() {
            self.apply_exposure(request, ctx);
            return;
        }

        match *control {
            ManualControl::WhiteBalance(_) | ManualControl::Reset(SettingKind::WhiteBalance) => {
                self.apply_white_balance(request)
            }
            ManualControl::Zoom(_) | ManualControl::Reset(SettingKind::Zoom) => {
                self.apply_zoom(request, ctx.caps)
            }
            ManualControl::Focus(_) | ManualControl::Reset(SettingKind::Focus) => {
                self.apply_focus(request, ctx.caps)
            }
            ManualControl::FocusAt { x, y } => focus_at(request, x, y, ctx.caps),
            ManualControl::Stabilization(_) | ManualControl::Reset(SettingKind::Stabilization) => {
                request.video_stabilization = self.stabilization.unwrap_or(false)
            }
            ManualControl::OpticalStabilization(_)
            | ManualControl::Reset(SettingKind::OpticalStabilization) => {
                request.optical_stabilization = self.optical_stabilization.unwrap_or(false)
            }
            ManualControl::Torch(_) | ManualControl::Reset(SettingKind::Torch) => {
                self.apply_torch(request, ctx.caps)
            }
            ManualControl::FaceDetection(_) | ManualControl::Reset(SettingKind::FaceDetection) => {
                self.apply_face_detection(request, ctx.caps)
            }
            _ => self.apply_to(request, ctx),
        }
    }

    /// Exposure time → ISO → exposure compensation
    ///
    /// Each manual step turns AE off and zeroes AE compensation in the same
    /// mutation, so AE and a manual exposure are never active together.
    fn apply_exposure(&self, request: &mut CaptureRequest, ctx: &ApplyContext<'_>) {
        if self.auto_exposure() {
            request.ae_mode = AeMode::On;
            request.ae_compensation = 0;
            request.sensor_exposure_time_ns = None;
            request.sensor_sensitivity = None;
            return;
        }

        request.sensor_exposure_time_ns = None;
        request.sensor_sensitivity = None;

        if let Some(ns) = self.exposure_time_ns {
            request.ae_mode = AeMode::Off;
            request.ae_compensation = 0;
            request.sensor_exposure_time_ns = Some(clamp_exposure(ns, ctx.caps));
        }

        if let Some(iso) = self.iso {
            request.ae_mode = AeMode::Off;
            let iso = ctx.caps.iso_range.map_or(iso, |range| range.clamp(iso));
            request.sensor_sensitivity = Some(iso);
        }

        if self.exposure_compensation.is_some() {
            request.ae_mode = AeMode::Off;
            request.ae_compensation = 0;
            request.sensor_exposure_time_ns = self.effective_exposure_ns(ctx);
        }
    }

    fn apply_white_balance(&self, request: &mut CaptureRequest) {
        match self.white_balance {
            Some(WhiteBalance::Manual { kelvin }) => {
                request.control_mode = ControlMode::Auto;
                request.awb_mode = AwbMode::Off;
                request.color_correction = Some(ColorCorrection {
                    gains: kelvin_to_gains(kelvin),
                    transform: IDENTITY_TRANSFORM,
                });
            }
            Some(WhiteBalance::Auto) | None => {
                request.awb_mode = AwbMode::Auto;
                request.color_correction = None;
            }
        }
    }

    fn apply_zoom(&self, request: &mut CaptureRequest, caps: &DeviceCapabilities) {
        request.zoom_ratio = None;
        request.crop_region = None;

        let Some(ratio) = self.zoom else {
            return;
        };
        let ratio = caps.zoom_range().clamp(ratio);
        if caps.native_zoom() {
            request.zoom_ratio = Some(ratio);
        } else {
            request.crop_region = Some(zoom_crop(&caps.active_array, ratio));
        }
    }

    fn apply_focus(&self, request: &mut CaptureRequest, caps: &DeviceCapabilities) {
        request.af_trigger = AfTrigger::Idle;
        match self.focus {
            Some(Focus::Auto) | None => {
                request.lens_focus_distance = None;
                if let Some(mode) = caps.preferred_af_mode() {
                    request.af_mode = mode;
                }
            }
            Some(Focus::Off) => {
                if caps.supports_af_off() {
                    request.af_mode = AfMode::Off;
                }
            }
            Some(Focus::Distance(distance)) => {
                if caps.supports_af_off() {
                    request.af_mode = AfMode::Off;
                    request.af_regions.clear();
                }
                request.lens_focus_distance = Some(distance.max(0.0));
            }
        }
    }

    fn apply_torch(&self, request: &mut CaptureRequest, caps: &DeviceCapabilities) {
        request.flash_mode = match self.torch {
            Some(true) if caps.flash_available => FlashMode::Torch,
            _ => FlashMode::Off,
        };
    }

    fn apply_face_detection(&self, request: &mut CaptureRequest, caps: &DeviceCapabilities) {
        request.face_detect_mode = match self.face_detection {
            Some(true) => caps.max_face_detect_mode(),
            _ => FaceDetectMode::Off,
        };
    }
}

/// Auto-focus on a ±100 px square around (x, y), clamped to the active array
fn focus_at(request: &mut CaptureRequest, x: i32, y: i32, caps: &DeviceCapabilities) {
    let rect = Rect::new(
        x - TAP_FOCUS_HALF_SIZE,
        y - TAP_FOCUS_HALF_SIZE,
        TAP_FOCUS_HALF_SIZE * 2,
        TAP_FOCUS_HALF_SIZE * 2,
    )
    .clamp_to(&caps.active_array);

    request.control_mode = ControlMode::Auto;
    request.af_mode = AfMode::Auto;
    request.af_regions = vec![MeteringRect { rect, weight: 0 }];
    request.af_trigger = AfTrigger::Start;
    request.lens_focus_distance = None;
}

/// `base × 2^ev`, clamped to the device's exposure range
pub fn scale_exposure(base_ns: u64, ev: i32, ctx: &ApplyContext<'_>) -> u64 {
    let ev = ctx.caps.ev_range.map_or(ev, |range| range.clamp(ev));
    let scaled = (base_ns as f64 * 2f64.powi(ev)).round() as u64;
    clamp_exposure(scaled, ctx.caps)
}

fn clamp_exposure(ns: u64, caps: &DeviceCapabilities) -> u64 {
    caps.exposure_time_range.map_or(ns, |range| range.clamp(ns))
}

/// Approximate RGGB gains for a color temperature
///
/// Linear between 2000 K (red 2.0, blue 0.5) and 8000 K (red 0.5, blue 2.0);
/// values outside that span are clamped.
pub fn kelvin_to_gains(kelvin: u32) -> RggbGains {
    let kelvin = kelvin.clamp(MIN_KELVIN, MAX_KELVIN) as f32;
    let t = (kelvin - MIN_KELVIN as f32) / (MAX_KELVIN - MIN_KELVIN) as f32;
    RggbGains {
        red: 2.0 - t * 1.5,
        green_even: 1.0,
        green_odd: 1.0,
        blue: 0.5 + t * 1.5,
    }
}

/// Centered crop covering `1/zoom` of each dimension of the active array
///
/// Every edge lands on an even sensor coordinate inside the active array.
pub fn zoom_crop(active: &Rect, zoom: f32) -> Rect {
    let zoom = f64::from(zoom.max(1.0));
    let (left, width) = even_span(active.left, active.width, zoom);
    let (top, height) = even_span(active.top, active.height, zoom);
    Rect::new(left, top, width, height)
}

/// Centered sub-span of `[start, start + len)` with even absolute bounds
fn even_span(start: i32, len: i32, zoom: f64) -> (i32, i32) {
    let lo = start + (start & 1);
    let hi = (start + len) & !1;
    let room = (hi - lo).max(0);
    let size = round_even(f64::from(len) / zoom).clamp(0, room);
    let offset = round_even(f64::from(start) + f64::from(len - size) / 2.0);
    (offset.clamp(lo, hi - size), size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::device::HardwareLevel;
    use crate::video::format::{Facing, FpsRange, Range, Resolution};

    fn caps() -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::minimal("0", Facing::Back, vec![Resolution::HD1080]);
        caps.hardware_level = HardwareLevel::Full;
        caps.iso_range = Some(Range::new(100, 3200));
        caps.exposure_time_range = Some(Range::new(100_000, 500_000_000));
        caps.ev_range = Some(Range::new(-12, 12));
        caps.active_array = Rect::new(0, 0, 4000, 3000);
        caps.max_digital_zoom = 8.0;
        caps.flash_available = true;
        caps.af_modes = vec![AfMode::Off, AfMode::Auto, AfMode::ContinuousVideo];
        caps
    }

    fn request() -> CaptureRequest {
        CaptureRequest::preview(Vec::new(), FpsRange::fixed(30))
    }

    #[test]
    fn test_reapply_exposure_then_compensation() {
        let caps = caps();
        let ctx = ApplyContext {
            caps: &caps,
            ev_base_ns: 16_666_667,
        };

        let mut settings = ManualSettings::default();
        settings.merge(&ManualControl::ExposureTime(10_000_000));
        settings.merge(&ManualControl::ExposureCompensation(1));

        let mut req = request();
        settings.apply_to(&mut req, &ctx);

        assert_eq!(req.sensor_exposure_time_ns, Some(20_000_000));
        assert_eq!(req.ae_mode, AeMode::Off);
        assert_eq!(req.ae_compensation, 0);
        assert!(!req.has_exposure_conflict());
    }

    #[test]
    fn test_compensation_without_exposure_uses_base() {
        let caps = caps();
        let ctx = ApplyContext {
            caps: &caps,
            ev_base_ns: 8_000_000,
        };

        let mut settings = ManualSettings::default();
        settings.merge(&ManualControl::ExposureCompensation(-1));

        let mut req = request();
        settings.apply_to(&mut req, &ctx);
        assert_eq!(req.sensor_exposure_time_ns, Some(4_000_000));
    }

    #[test]
    fn test_iso_turns_auto_exposure_off() {
        let caps = caps();
        let ctx = ApplyContext {
            caps: &caps,
            ev_base_ns: 16_666_667,
        };
        let mut settings = ManualSettings::default();
        let mut req = request();

        let control = ManualControl::Iso(6400);
        settings.merge(&control);
        settings.apply_control(&mut req, &control, &ctx);

        assert_eq!(req.ae_mode, AeMode::Off);
        assert_eq!(req.sensor_sensitivity, Some(3200));

        let reset = ManualControl::Reset(SettingKind::Exposure);
        settings.merge(&reset);
        settings.apply_control(&mut req, &reset, &ctx);
        assert_eq!(req.ae_mode, AeMode::On);
        assert_eq!(req.sensor_sensitivity, None);
    }

    #[test]
    fn test_kelvin_gains() {
        let warm = kelvin_to_gains(2000);
        assert_eq!((warm.red, warm.blue), (2.0, 0.5));

        let cold = kelvin_to_gains(8000);
        assert_eq!((cold.red, cold.blue), (0.5, 2.0));

        let mid = kelvin_to_gains(5000);
        assert!((mid.red - 1.25).abs() < 1e-6);
        assert!((mid.blue - 1.25).abs() < 1e-6);

        assert_eq!(kelvin_to_gains(1000), warm);
        assert_eq!(kelvin_to_gains(12000), cold);
    }

    #[test]
    fn test_manual_white_balance_disables_awb() {
        let mut settings = ManualSettings::default();
        settings.merge(&ManualControl::WhiteBalance(WhiteBalance::Manual { kelvin: 5600 }));

        let mut req = request();
        settings.apply_white_balance(&mut req);
        assert_eq!(req.awb_mode, AwbMode::Off);
        let cc = req.color_correction.unwrap();
        assert_eq!(cc.transform, IDENTITY_TRANSFORM);
        assert_eq!(cc.gains.green_even, 1.0);
    }

    #[test]
    fn test_zoom_crop_half() {
        let active = Rect::new(0, 0, 4000, 3000);
        let crop = zoom_crop(&active, 2.0);
        assert_eq!(crop, Rect::new(1000, 750, 2000, 1500));
        assert_eq!(crop.center(), active.center());
        for edge in [crop.left, crop.top, crop.right(), crop.bottom()] {
            assert_eq!(edge % 2, 0);
        }
    }

    #[test]
    fn test_zoom_crop_rounds_to_even() {
        let active = Rect::new(8, 4, 4032, 3024);
        let crop = zoom_crop(&active, 3.0);
        assert_eq!(crop.width, 1344);
        assert_eq!(crop.height, 1008);
        for edge in [crop.left, crop.top, crop.right(), crop.bottom()] {
            assert_eq!(edge % 2, 0);
        }
    }

    #[test]
    fn test_zoom_crop_odd_active_origin() {
        let active = Rect::new(1, 1, 4000, 3000);
        for zoom in [1.0, 1.5, 2.0, 3.0, 7.3] {
            let crop = zoom_crop(&active, zoom);
            for edge in [crop.left, crop.top, crop.right(), crop.bottom()] {
                assert_eq!(edge % 2, 0, "zoom {} gave {:?}", zoom, crop);
            }
            assert!(crop.left >= active.left && crop.top >= active.top);
            assert!(crop.right() <= active.right() && crop.bottom() <= active.bottom());
        }

        let crop = zoom_crop(&active, 2.0);
        assert_eq!(crop, Rect::new(1002, 752, 2000, 1500));
    }

    #[test]
    fn test_native_zoom_uses_ratio() {
        let mut caps = caps();
        caps.zoom_ratio_range = Some(Range::new(1.0, 10.0));
        let mut settings = ManualSettings::default();
        settings.merge(&ManualControl::Zoom(20.0));

        let mut req = request();
        settings.apply_zoom(&mut req, &caps);
        assert_eq!(req.zoom_ratio, Some(10.0));
        assert_eq!(req.crop_region, None);
    }

    #[test]
    fn test_focus_at_clamps_region() {
        let caps = caps();
        let mut req = request();
        focus_at(&mut req, 50, 2950, &caps);
        assert_eq!(req.af_trigger, AfTrigger::Start);
        assert_eq!(req.af_mode, AfMode::Auto);
        assert_eq!(req.af_regions[0].rect, Rect::new(0, 2850, 150, 150));
    }

    #[test]
    fn test_validate_unsupported_controls() {
        let mut caps = caps();
        caps.flash_available = false;
        assert!(ManualControl::Torch(true).validate(&caps).is_err());
        assert!(ManualControl::Torch(false).validate(&caps).is_ok());
        assert!(ManualControl::Stabilization(true).validate(&caps).is_err());
        assert!(ManualControl::FaceDetection(true).validate(&caps).is_err());
        assert!(ManualControl::Zoom(f32::NAN).validate(&caps).is_err());
        assert!(ManualControl::Iso(400).validate(&caps).is_ok());
    }

    #[test]
    fn test_reset_all_restores_template() {
        let caps = caps();
        let ctx = ApplyContext {
            caps: &caps,
            ev_base_ns: 16_666_667,
        };
        let mut settings = ManualSettings::default();
        let mut live = request();
        for control in [
            ManualControl::ExposureTime(1_000_000),
            ManualControl::Iso(800),
            ManualControl::Torch(true),
            ManualControl::Zoom(2.0),
            ManualControl::Focus(Focus::Distance(2.5)),
            ManualControl::Stabilization(true),
        ] {
            settings.merge(&control);
            settings.apply_control(&mut live, &control, &ctx);
        }
        assert_eq!(live.ae_mode, AeMode::Off);
        assert_eq!(live.flash_mode, FlashMode::Torch);
        assert!(live.crop_region.is_some());

        let reset = ManualControl::Reset(SettingKind::All);
        settings.merge(&reset);
        assert!(settings.is_empty());
        settings.apply_control(&mut live, &reset, &ctx);

        let mut fresh = request();
        settings.apply_to(&mut fresh, &ctx);
        assert_eq!(live, fresh);
        assert_eq!(live.ae_mode, AeMode::On);
        assert_eq!(live.sensor_exposure_time_ns, None);
        assert_eq!(live.sensor_sensitivity, None);
        assert_eq!(live.crop_region, None);
        assert_eq!(live.lens_focus_distance, None);
        assert!(!live.video_stabilization);
        assert_eq!(live.flash_mode, FlashMode::Off);
    }
}
