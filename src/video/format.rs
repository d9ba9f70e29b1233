//! Geometry and pixel format definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc;

/// Pixel formats produced by the capture sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// MJPEG compressed (most UVC cameras at high resolutions)
    Mjpeg,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// NV12 semi-planar, the usual encoder input
    Nv12,
    /// YUV420 planar
    Yuv420,
    /// Opaque frames from a platform camera, already in the encoder's layout
    Private,
}

impl PixelFormat {
    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> fourcc::FourCC {
        match self {
            PixelFormat::Mjpeg => fourcc::FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => fourcc::FourCC::new(b"YUYV"),
            PixelFormat::Nv12 | PixelFormat::Private => fourcc::FourCC::new(b"NV12"),
            PixelFormat::Yuv420 => fourcc::FourCC::new(b"YU12"),
        }
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: fourcc::FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            _ => None,
        }
    }

    /// Expected frame size, None for compressed formats
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Mjpeg | PixelFormat::Private => None,
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(pixels * 3 / 2),
        }
    }

    /// Preference when a UVC device offers several formats (higher is better)
    pub fn priority(&self) -> u8 {
        match self {
            PixelFormat::Nv12 => 100,
            PixelFormat::Yuv420 => 90,
            PixelFormat::Yuyv => 80,
            PixelFormat::Mjpeg => 70,
            PixelFormat::Private => 0,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Private => "PRIVATE",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions divisible by two, as required by 4:2:0 encoders
    pub fn is_even(&self) -> bool {
        self.width % 2 == 0 && self.height % 2 == 0
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which camera a device id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
    External,
}

impl Facing {
    /// The other built-in camera; external stays external
    pub fn flipped(self) -> Self {
        match self {
            Facing::Front => Facing::Back,
            Facing::Back => Facing::Front,
            Facing::External => Facing::External,
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Front => write!(f, "front"),
            Facing::Back => write!(f, "back"),
            Facing::External => write!(f, "external"),
        }
    }
}

/// Inclusive frame rate range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

impl FpsRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn fixed(fps: u32) -> Self {
        Self { min: fps, max: fps }
    }

    pub fn contains(&self, fps: u32) -> bool {
        fps >= self.min && fps <= self.max
    }
}

/// Inclusive numeric range for a control (ISO, EV, exposure time, zoom)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd + Copy> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: T) -> T {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else {
            value
        }
    }
}

/// Axis-aligned rectangle in sensor pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height
    }

    pub fn center(&self) -> (i32, i32) {
        (self.left + self.width / 2, self.top + self.height / 2)
    }

    /// Intersection with `bounds`; empty rectangles have zero size
    pub fn clamp_to(&self, bounds: &Rect) -> Rect {
        let left = self.left.max(bounds.left);
        let top = self.top.max(bounds.top);
        let right = self.right().min(bounds.right());
        let bottom = self.bottom().min(bounds.bottom());
        Rect::new(left, top, (right - left).max(0), (bottom - top).max(0))
    }
}

/// Round to the nearest even integer
pub fn round_even(value: f64) -> i32 {
    ((value / 2.0).round() as i32) * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_even() {
        assert_eq!(round_even(1500.0), 1500);
        assert_eq!(round_even(1333.3), 1334);
        assert_eq!(round_even(1332.9), 1332);
        assert_eq!(round_even(0.4), 0);
    }

    #[test]
    fn test_rect_clamp() {
        let bounds = Rect::new(0, 0, 4000, 3000);
        let rect = Rect::new(-50, 2950, 200, 200);
        assert_eq!(rect.clamp_to(&bounds), Rect::new(0, 2950, 150, 50));
    }

    #[test]
    fn test_range_clamp() {
        let iso = Range::new(100u32, 3200);
        assert_eq!(iso.clamp(50), 100);
        assert_eq!(iso.clamp(6400), 3200);
        assert!(iso.contains(800));
    }

    #[test]
    fn test_fourcc_roundtrip_for_uvc_formats() {
        for format in [PixelFormat::Mjpeg, PixelFormat::Yuyv, PixelFormat::Nv12] {
            assert_eq!(PixelFormat::from_fourcc(format.to_fourcc()), Some(format));
        }
    }
}
