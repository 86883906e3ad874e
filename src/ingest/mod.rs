//! Frame ingestion sources.
//!
//! This module provides sources for decoded frames:
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - Stub source (`stub://` URLs, synthetic scene for demos and tests)
//!
//! A source belongs to exactly one camera worker. The worker drives the
//! connection lifecycle: `connect`, a run of `next_frame` calls, then
//! `disconnect` on end-of-stream, read failure or shutdown.
//!
//! Failures to open or read a stream are reported as
//! `PipelineError::SourceUnavailable`; the worker answers them by
//! reconnecting with backoff, never by exiting.

pub mod rtsp;

use anyhow::Result;

use crate::frame::Frame;
use crate::CameraId;

pub use rtsp::{RtspConfig, RtspSource};

/// Source of decoded frames for one camera.
pub trait FrameSource: Send {
    /// Open (or reopen) the stream.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    ///
    /// `Ok(None)` signals a clean end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the stream handle. Safe to call when not connected.
    fn disconnect(&mut self) {}

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    /// Get frame statistics.
    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub camera_id: CameraId,
    pub frames_captured: u64,
    pub connects: u64,
    pub locator: String,
}

/// Open the source named by `locator` for `camera_id`.
pub fn open_source(
    camera_id: CameraId,
    locator: &str,
    target_fps: u32,
    width: u32,
    height: u32,
) -> Result<Box<dyn FrameSource>> {
    let config = RtspConfig {
        camera_id,
        url: locator.to_string(),
        target_fps,
        width,
        height,
    };
    Ok(Box::new(RtspSource::new(config)?))
}
