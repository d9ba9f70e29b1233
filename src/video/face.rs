//! Face rectangle mapping
//!
//! Capture results report faces in active-array pixels, in the sensor's own
//! orientation. Callers want them in the coordinate space of whatever view
//! renders the output surface.

use super::format::{Facing, Rect, Resolution};
use crate::events::FaceInfo;

/// A face as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedFace {
    pub bounds: Rect,
    /// Confidence 1-100
    pub score: u8,
}

/// Everything needed to map faces for one open device
#[derive(Debug, Clone, Copy)]
pub struct FaceMapper {
    pub active_array: Rect,
    pub sensor_orientation: u32,
    pub facing: Facing,
    pub view: Resolution,
}

impl FaceMapper {
    pub fn map(&self, face: &DetectedFace) -> FaceInfo {
        let (x0, y0) = self.map_point(face.bounds.left, face.bounds.top);
        let (x1, y1) = self.map_point(face.bounds.right(), face.bounds.bottom());
        FaceInfo {
            left: x0.min(x1),
            top: y0.min(y1),
            right: x0.max(x1),
            bottom: y0.max(y1),
            score: face.score,
        }
    }

    pub fn map_all(&self, faces: &[DetectedFace]) -> Vec<FaceInfo> {
        faces.iter().map(|f| self.map(f)).collect()
    }

    /// Normalize into the active array, rotate by the sensor orientation,
    /// mirror for front cameras, then scale to the view
    fn map_point(&self, x: i32, y: i32) -> (f32, f32) {
        let aw = self.active_array.width.max(1) as f32;
        let ah = self.active_array.height.max(1) as f32;
        let nx = (x - self.active_array.left) as f32 / aw;
        let ny = (y - self.active_array.top) as f32 / ah;

        let (rx, ry) = match self.sensor_orientation % 360 {
            90 => (1.0 - ny, nx),
            180 => (1.0 - nx, 1.0 - ny),
            270 => (ny, 1.0 - nx),
            _ => (nx, ny),
        };
        let rx = if self.facing == Facing::Front { 1.0 - rx } else { rx };

        (
            rx.clamp(0.0, 1.0) * self.view.width as f32,
            ry.clamp(0.0, 1.0) * self.view.height as f32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(actual: (f32, f32), expected: (f32, f32)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-3 && (actual.1 - expected.1).abs() < 1e-3,
            "{:?} != {:?}",
            actual,
            expected
        );
    }

    fn mapper(orientation: u32, facing: Facing) -> FaceMapper {
        FaceMapper {
            active_array: Rect::new(0, 0, 4000, 3000),
            sensor_orientation: orientation,
            facing,
            view: Resolution::new(400, 300),
        }
    }

    #[test]
    fn test_identity_mapping_scales() {
        let face = DetectedFace {
            bounds: Rect::new(1000, 600, 400, 300),
            score: 90,
        };
        let info = mapper(0, Facing::Back).map(&face);
        approx((info.left, info.top), (100.0, 60.0));
        approx((info.right, info.bottom), (140.0, 90.0));
        assert_eq!(info.score, 90);
    }

    #[test]
    fn test_front_camera_is_mirrored() {
        let face = DetectedFace {
            bounds: Rect::new(0, 0, 400, 300),
            score: 50,
        };
        let info = mapper(0, Facing::Front).map(&face);
        approx((info.left, info.right), (360.0, 400.0));
    }

    #[test]
    fn test_rotation_90() {
        let face = DetectedFace {
            bounds: Rect::new(0, 0, 2000, 1500),
            score: 10,
        };
        // Top-left quadrant of the sensor ends up top-right after a 90° turn
        let info = mapper(90, Facing::Back).map(&face);
        approx((info.left, info.top), (200.0, 0.0));
        approx((info.right, info.bottom), (400.0, 150.0));
    }
}
