//! RTSP frame source.
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras via RTSP.
//!
//! The RTSP source is responsible for:
//! - Connecting to camera streams (and reconnecting when asked to)
//! - Decoding video frames to RGB
//! - Stamping frames with a sequence number and capture time
//!
//! `stub://name` URLs produce a synthetic scene. Appending `?frames=N` ends
//! the synthetic stream after N frames, which exercises end-of-stream handling.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use super::{FrameSource, SourceStats};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::{now_ms, CameraId};

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    pub camera_id: CameraId,
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Target frame rate (frames per second). Source will decimate to this rate.
    pub target_fps: u32,
    /// Frame width (for synthetic frames).
    pub width: u32,
    /// Frame height (for synthetic frames).
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            camera_id: 0,
            url: "rtsp://localhost:8554/0".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(PipelineError::config(format!(
                "camera {}: source locator is empty",
                config.camera_id
            )));
        }
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                Err(PipelineError::config(format!(
                    "camera {}: {} requires the rtsp-gstreamer feature",
                    config.camera_id, config.url
                )))
            }
        }
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.disconnect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.disconnect(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_limit: Option<u64>,
    frame_count: u64,
    /// Frames served since the last connect; `frame_limit` applies to this.
    session_frames: u64,
    connects: u64,
    connected: bool,
    next_due: Option<Instant>,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        let frame_limit = parse_frame_limit(&config.url);
        Self {
            config,
            frame_limit,
            frame_count: 0,
            session_frames: 0,
            connects: 0,
            connected: false,
            next_due: None,
        }
    }

    /// Synthetic sources are always reachable.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.connects += 1;
        self.session_frames = 0;
        self.next_due = None;
        log::info!(
            "RtspSource: camera {} connected to {} (synthetic)",
            self.config.camera_id,
            self.config.url
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(PipelineError::source(
                self.config.camera_id,
                "synthetic source read before connect",
            ));
        }
        if self.frame_limit.is_some_and(|limit| self.session_frames >= limit) {
            return Ok(None);
        }
        self.pace();

        let seq = self.frame_count;
        self.frame_count += 1;
        self.session_frames += 1;
        let image = self.generate_synthetic_image(seq);
        Ok(Some(Frame::new(self.config.camera_id, seq, now_ms()?, image)))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Sleep until the next frame slot for `target_fps`.
    fn pace(&mut self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_millis(1000 / self.config.target_fps as u64);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }

    /// Slowly drifting gradient, so consecutive frames differ.
    fn generate_synthetic_image(&self, seq: u64) -> RgbImage {
        let shift = (seq % 256) as u32;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift / 2) % 256) as u8,
                ((x + y) % 256) as u8,
            ])
        })
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            camera_id: self.config.camera_id,
            frames_captured: self.frame_count,
            connects: self.connects,
            locator: self.config.url.clone(),
        }
    }
}

fn parse_frame_limit(url: &str) -> Option<u64> {
    let (_, query) = url.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "frames")
        .and_then(|(_, value)| value.parse().ok())
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    frame_count: u64,
    connects: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            frame_count: 0,
            connects: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    /// Build `rtspsrc ! decodebin ! videoconvert ! appsink` and start playing.
    /// A fresh pipeline is built on every connect.
    fn connect(&mut self) -> Result<()> {
        self.disconnect();
        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.config.url
        );
        let camera_id = self.config.camera_id;
        let unavailable = |reason: String| PipelineError::source(camera_id, reason);

        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .map_err(|e| unavailable(format!("build RTSP pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| unavailable("RTSP pipeline is not a Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| unavailable("appsink element missing from pipeline".to_string()))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| unavailable("appsink element has unexpected type".to_string()))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| unavailable(format!("set RTSP pipeline to Playing: {}", e)))?;

        self.pipeline = Some((pipeline, appsink));
        self.connects += 1;
        self.last_error = None;
        self.connected_at = Some(Instant::now());
        log::info!("RtspSource: camera {} connected to {}", camera_id, self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        let camera_id = self.config.camera_id;
        if let Some(err) = &self.last_error {
            return Err(PipelineError::source(camera_id, err.clone()));
        }
        let timeout = self.frame_timeout();
        let Some((_, appsink)) = &self.pipeline else {
            return Err(PipelineError::source(camera_id, "RTSP source not connected"));
        };

        let sample = match appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None if appsink.is_eos() => return Ok(None),
            None => return Err(PipelineError::source(camera_id, "RTSP stream stalled")),
        };

        let image = sample_to_image(&sample)
            .map_err(|e| PipelineError::source(camera_id, format!("{:#}", e)))?;

        let seq = self.frame_count;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(Frame::new(camera_id, seq, now_ms()?, image)))
    }

    fn disconnect(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!(
                    "RtspSource: camera {} failed to stop pipeline: {}",
                    self.config.camera_id,
                    e
                );
            }
        }
        self.connected_at = None;
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            camera_id: self.config.camera_id,
            frames_captured: self.frame_count,
            connects: self.connects,
            locator: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        gstreamer::ClockTime::from_mseconds(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|(p, _)| p.bus()) else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    log::info!("RtspSource: camera {} reached EOS", self.config.camera_id);
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels).context("RTSP frame size mismatch")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn stub_config(url: &str) -> RtspConfig {
        RtspConfig {
            camera_id: 2,
            url: url.to_string(),
            target_fps: 0,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://test"))?;
        source.connect()?;

        let frame = source.next_frame()?.expect("frame");
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
        assert_eq!(frame.camera_id, 2);
        assert_eq!(frame.seq, 0);
        assert_eq!(source.next_frame()?.expect("frame").seq, 1);

        Ok(())
    }

    #[test]
    fn rtsp_source_frame_limit_ends_stream() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://test?frames=2"))?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());

        // Reconnecting restarts the synthetic stream.
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert_eq!(source.stats().connects, 2);
        Ok(())
    }

    #[test]
    fn rtsp_source_seq_keeps_increasing_across_reconnects() -> Result<()> {
        let mut source = RtspSource::new(stub_config("stub://test?frames=2"))?;
        let mut seqs = Vec::new();
        for _ in 0..2 {
            source.connect()?;
            while let Some(frame) = source.next_frame()? {
                seqs.push(frame.seq);
            }
            source.disconnect();
        }
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(source.stats().frames_captured, 4);
        Ok(())
    }

    #[test]
    fn rtsp_source_read_before_connect_is_source_unavailable() {
        let mut source = RtspSource::new(stub_config("stub://test")).unwrap();
        let err = source.next_frame().unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::SourceUnavailable);
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_requires_feature() {
        let err = RtspSource::new(stub_config("rtsp://camera/0")).err().unwrap();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);
    }
}
