//! Rendering consumer for annotated frames.
//!
//! Keeps the newest frame per camera and periodically writes one JPEG per
//! camera into a preview directory. A camera that is not streaming keeps
//! showing its last frame, or a grey placeholder if it never produced one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::aggregator::FrameAggregator;
use crate::frame::AnnotatedFrame;
use crate::shutdown::ShutdownSignal;
use crate::sink::encode_jpeg;
use crate::worker::WorkerState;
use crate::CameraId;

pub struct PreviewRenderer {
    dir: PathBuf,
    width: u32,
    height: u32,
    latest: BTreeMap<CameraId, AnnotatedFrame>,
    received: u64,
}

impl PreviewRenderer {
    pub fn new(dir: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            dir: dir.into(),
            width,
            height,
            latest: BTreeMap::new(),
            received: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Frames ingested so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn ingest(&mut self, frame: AnnotatedFrame) {
        self.received += 1;
        match self.latest.get(&frame.camera_id) {
            // Never replace a newer frame with an older one.
            Some(prev) if prev.captured_at_ms > frame.captured_at_ms => {}
            _ => {
                self.latest.insert(frame.camera_id, frame);
            }
        }
    }

    /// What should be shown for `camera_id` given its worker state.
    pub fn view(&self, camera_id: CameraId, state: WorkerState) -> AnnotatedFrame {
        match self.latest.get(&camera_id) {
            Some(frame) => {
                let mut frame = frame.clone();
                frame.state = state;
                frame
            }
            None => AnnotatedFrame::placeholder(camera_id, self.width, self.height, state),
        }
    }

    pub fn preview_path(&self, camera_id: CameraId) -> PathBuf {
        self.dir.join(format!("cam{}.jpg", camera_id))
    }

    /// Write one JPEG per camera in `states`. Returns the number written.
    pub fn render(&self, states: &BTreeMap<CameraId, WorkerState>) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| anyhow!("create preview dir {}: {}", self.dir.display(), e))?;
        let mut written = 0;
        for (&camera_id, &state) in states {
            let view = self.view(camera_id, state);
            let bytes = encode_jpeg(&view.image)?;
            let path = self.preview_path(camera_id);
            let tmp = path.with_extension("jpg.tmp");
            std::fs::write(&tmp, &bytes).map_err(|e| anyhow!("write {}: {}", tmp.display(), e))?;
            std::fs::rename(&tmp, &path).map_err(|e| anyhow!("rename {}: {}", path.display(), e))?;
            written += 1;
        }
        Ok(written)
    }
}

/// Consume frames until shutdown, rendering every `interval` and logging
/// camera health every `health_interval`.
pub fn run(
    aggregator: &FrameAggregator,
    renderer: &mut PreviewRenderer,
    shutdown: &ShutdownSignal,
    interval: Duration,
    health_interval: Duration,
) {
    let poll = interval.min(Duration::from_millis(100));
    let mut last_render = Instant::now();
    let mut last_health = Instant::now();
    while !shutdown.is_triggered() {
        if let Some(frame) = aggregator.recv_timeout(poll) {
            renderer.ingest(frame);
        }
        if last_render.elapsed() >= interval {
            last_render = Instant::now();
            if let Err(e) = renderer.render(&aggregator.states()) {
                log::warn!("preview render failed: {:#}", e);
            }
        }
        if last_health.elapsed() >= health_interval {
            last_health = Instant::now();
            for (camera_id, state) in aggregator.states() {
                log::info!("camera {}: {}", camera_id, state);
            }
        }
    }
    for frame in aggregator.drain() {
        renderer.ingest(frame);
    }
    if let Err(e) = renderer.render(&aggregator.states()) {
        log::warn!("final preview render failed: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_until_first_frame_then_last_known() {
        let dir = tempfile::tempdir().unwrap();
        let mut renderer = PreviewRenderer::new(dir.path(), 8, 6);

        let grey = renderer.view(1, WorkerState::Reconnecting);
        assert_eq!(grey.image.get_pixel(0, 0).0, [64, 64, 64]);
        assert_eq!(grey.state, WorkerState::Reconnecting);

        let mut frame = AnnotatedFrame::placeholder(1, 8, 6, WorkerState::Streaming);
        frame.seq = 9;
        frame.captured_at_ms = 100;
        renderer.ingest(frame);
        let view = renderer.view(1, WorkerState::Reconnecting);
        assert_eq!(view.seq, 9);
        assert_eq!(view.state, WorkerState::Reconnecting);
    }

    #[test]
    fn render_writes_one_jpeg_per_camera() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = PreviewRenderer::new(dir.path().join("preview"), 8, 6);
        let states: BTreeMap<CameraId, WorkerState> =
            [(0, WorkerState::Streaming), (1, WorkerState::Stopped)].into_iter().collect();
        assert_eq!(renderer.render(&states).unwrap(), 2);
        assert!(renderer.preview_path(0).exists());
        assert!(renderer.preview_path(1).exists());
    }
}
