//! Output surfaces
//!
//! A `Surface` is the handle a capture pipeline writes frames into: the
//! encoder input, or the secondary image-reader output. Consumers subscribe
//! and receive every frame pushed while they are listening.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::format::Resolution;
use super::frame::VideoFrame;

/// Frames buffered per subscriber before it starts lagging
const DEFAULT_SURFACE_DEPTH: usize = 4;

pub struct Surface {
    id: Uuid,
    resolution: Resolution,
    tx: broadcast::Sender<VideoFrame>,
    delivered: AtomicU64,
}

impl Surface {
    pub fn new(resolution: Resolution) -> Self {
        Self::with_depth(resolution, DEFAULT_SURFACE_DEPTH)
    }

    /// Surface keeping at most `depth` frames per subscriber (image readers use `max_images`)
    pub fn with_depth(resolution: Resolution, depth: usize) -> Self {
        let (tx, _) = broadcast::channel(depth.max(1));
        Self {
            id: Uuid::new_v4(),
            resolution,
            tx,
            delivered: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Write a frame; frames with no subscriber are dropped
    pub fn push(&self, frame: VideoFrame) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VideoFrame> {
        self.tx.subscribe()
    }

    /// Frames written since creation
    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("resolution", &self.resolution)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::PixelFormat;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_push_and_receive() {
        let surface = Surface::new(Resolution::HD720);
        let mut rx = surface.subscribe();

        surface.push(VideoFrame::new(
            Bytes::from_static(b"frame"),
            Resolution::HD720,
            PixelFormat::Private,
            0,
            7,
        ));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.sequence, 7);
        assert_eq!(surface.frames_delivered(), 1);
    }
}
