//! Video frame data structures

use bytes::Bytes;
use std::time::Instant;

use super::format::{PixelFormat, Resolution};

/// A captured frame with metadata
///
/// Cloning is cheap: the pixel data is reference counted.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per line of the first plane
    pub stride: u32,
    /// Frame sequence number assigned by the source
    pub sequence: u64,
    /// Sensor timestamp in nanoseconds, when the platform reports one
    pub sensor_ts_ns: Option<i64>,
    /// When the frame reached user space
    pub capture_ts: Instant,
}

impl VideoFrame {
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            resolution,
            format,
            stride,
            sequence,
            sensor_ts_ns: None,
            capture_ts: Instant::now(),
        }
    }

    pub fn with_sensor_timestamp(mut self, ts_ns: i64) -> Self {
        self.sensor_ts_ns = Some(ts_ns);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the payload has the size the format implies
    ///
    /// Compressed and opaque formats are always accepted.
    pub fn has_expected_size(&self) -> bool {
        match self.format.frame_size(self.resolution) {
            Some(expected) => self.data.len() >= expected,
            None => !self.data.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_size() {
        let res = Resolution::new(4, 2);
        let frame = VideoFrame::new(Bytes::from(vec![0u8; 12]), res, PixelFormat::Nv12, 4, 0);
        assert!(frame.has_expected_size());

        let short = VideoFrame::new(Bytes::from(vec![0u8; 8]), res, PixelFormat::Nv12, 4, 1);
        assert!(!short.has_expected_size());

        let jpeg = VideoFrame::new(Bytes::from_static(b"\xff\xd8"), res, PixelFormat::Mjpeg, 0, 2);
        assert!(jpeg.has_expected_size());
    }
}
