//! Frame types flowing through a camera worker.
//!
//! - `Frame`: decoded RGB image as produced by a `FrameSource`.
//! - `AnnotatedFrame`: the same image after overlays, tagged for the
//!   rendering consumer.

use image::{Rgb, RgbImage};

use crate::worker::WorkerState;
use crate::CameraId;

/// Decoded frame from one camera.
#[derive(Clone, Debug)]
pub struct Frame {
    pub camera_id: CameraId,
    /// Per-source sequence number, strictly increasing across reconnects.
    pub seq: u64,
    /// Capture time in milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(camera_id: CameraId, seq: u64, captured_at_ms: u64, image: RgbImage) -> Self {
        Self {
            camera_id,
            seq,
            captured_at_ms,
            image,
        }
    }

    /// Solid black frame. Handy for tests and placeholder rendering.
    pub fn blank(
        camera_id: CameraId,
        seq: u64,
        width: u32,
        height: u32,
        captured_at_ms: u64,
    ) -> Self {
        Self::new(
            camera_id,
            seq,
            captured_at_ms,
            RgbImage::from_pixel(width, height, Rgb([0, 0, 0])),
        )
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Frame after overlays, ready for the display loop.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub camera_id: CameraId,
    pub seq: u64,
    pub captured_at_ms: u64,
    pub image: RgbImage,
    /// Worker state at the time the frame was produced.
    pub state: WorkerState,
    /// Number of tracks violating at least one rule in this frame.
    pub violators: usize,
}

impl AnnotatedFrame {
    /// Grey frame shown for a camera that has nothing fresh to display.
    pub fn placeholder(camera_id: CameraId, width: u32, height: u32, state: WorkerState) -> Self {
        Self {
            camera_id,
            seq: 0,
            captured_at_ms: 0,
            image: RgbImage::from_pixel(width, height, Rgb([64, 64, 64])),
            state,
            violators: 0,
        }
    }
}
