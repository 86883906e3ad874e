//! Camera worker: one thread per camera driving the full per-frame
//! pipeline.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Streaming
//!                     ^             |  (end of stream / read failure)
//!                     |             v
//!                     +------ Reconnecting --(retries exhausted)--> Stopped
//! any state --(shutdown)--> Stopped
//! ```
//!
//! Backoff between reconnect attempts grows exponentially up to a cap and
//! is reset after a frame is processed successfully. Failures inside the
//! worker never reach other workers or the alert sink.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;

use crate::aggregator::FramePublisher;
use crate::alert::AlertEvent;
use crate::annotate::annotate;
use crate::debounce::AlertDebouncer;
use crate::detect::{DetectorBackend, Detection};
use crate::frame::{AnnotatedFrame, Frame};
use crate::ingest::FrameSource;
use crate::rules::{RuleOutcome, RuleSet};
use crate::shutdown::ShutdownSignal;
use crate::sink::{snapshot_image, AlertJob, AlertSender, SnapshotMode};
use crate::track_state::{TrackStateStore, Transition};
use crate::CameraId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connecting => "connecting",
            WorkerState::Streaming => "streaming",
            WorkerState::Reconnecting => "reconnecting",
            WorkerState::Stopped => "stopped",
        }
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::Connecting,
            2 => WorkerState::Streaming,
            3 => WorkerState::Reconnecting,
            4 => WorkerState::Stopped,
            _ => WorkerState::Disconnected,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failed attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Random spread applied to each delay, as a fraction (0.2 = +/-20%).
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_retries: None,
            jitter: 0.2,
        }
    }
}

/// Capped exponential backoff.
#[derive(Clone, Debug)]
pub struct Backoff {
    settings: BackoffSettings,
    attempt: u32,
}

impl Backoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self { settings, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.settings.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        let base = self
            .settings
            .initial
            .saturating_mul(factor)
            .min(self.settings.max);
        self.attempt = self.attempt.saturating_add(1);
        if self.settings.jitter <= 0.0 {
            return Some(base);
        }
        let spread = self.settings.jitter.min(1.0);
        let scale = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
        Some(base.mul_f64(scale).min(self.settings.max))
    }
}

/// Everything a worker needs to know about its camera.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub camera_id: CameraId,
    pub rules: RuleSet,
    pub cooldown: Duration,
    /// How long a track may go unseen before its state is forgotten.
    pub grace: Duration,
    /// Attach a snapshot image to each alert.
    pub snapshots: bool,
    pub snapshot_mode: SnapshotMode,
    pub backoff: BackoffSettings,
}

impl WorkerSettings {
    pub fn new(camera_id: CameraId, rules: RuleSet) -> Self {
        Self {
            camera_id,
            rules,
            cooldown: Duration::from_secs(10),
            grace: Duration::from_secs(5),
            snapshots: true,
            snapshot_mode: SnapshotMode::Frame,
            backoff: BackoffSettings::default(),
        }
    }
}

/// Counters shared with whoever wants to watch the worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames_processed: AtomicU64,
    detector_failures: AtomicU64,
    alerts_emitted: AtomicU64,
    alerts_dropped: AtomicU64,
    reconnects: AtomicU64,
    state: AtomicU8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub frames_processed: u64,
    pub detector_failures: u64,
    pub alerts_emitted: u64,
    pub alerts_dropped: u64,
    pub reconnects: u64,
    pub state: WorkerState,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            state: self.state(),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }
}

/// Result of one processed frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub detections: usize,
    /// Alerts handed to the sink (including ones the queue then dropped).
    pub alerts: usize,
    pub violators: usize,
}

pub struct CameraWorker {
    settings: WorkerSettings,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    tracks: TrackStateStore,
    debouncer: AlertDebouncer,
    alerts: AlertSender,
    frames: FramePublisher,
    stats: Arc<WorkerStats>,
    zone_names: Vec<String>,
}

impl CameraWorker {
    pub fn new(
        settings: WorkerSettings,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        alerts: AlertSender,
        frames: FramePublisher,
    ) -> Self {
        let zone_names = settings.rules.zones.iter().map(|z| z.name.clone()).collect();
        let cooldown_ms = duration_ms(settings.cooldown);
        Self {
            settings,
            source,
            detector,
            tracks: TrackStateStore::new(),
            debouncer: AlertDebouncer::new(cooldown_ms),
            alerts,
            frames,
            stats: Arc::new(WorkerStats::default()),
            zone_names,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.settings.camera_id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> WorkerState {
        self.stats.state()
    }

    pub fn tracked_records(&self) -> usize {
        self.tracks.len()
    }

    fn set_state(&mut self, next: WorkerState) {
        let prev = self.stats.state();
        if prev == next {
            return;
        }
        self.stats.state.store(next.to_u8(), Ordering::Relaxed);
        self.frames.set_state(next);
        log::info!("camera {}: {} -> {}", self.settings.camera_id, prev, next);
    }

    /// Run the pipeline for one frame.
    ///
    /// A detector failure skips the frame. Alert delivery problems never
    /// fail the frame.
    pub fn process_frame(&mut self, frame: Frame) -> FrameReport {
        let camera_id = self.settings.camera_id;
        let now = frame.captured_at_ms;

        let detections = match self.detector.detect_and_track(&frame) {
            Ok(detections) => detections,
            Err(e) => {
                self.stats.detector_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "camera {} frame {}: {} failed, skipping frame: {:#}",
                    camera_id,
                    frame.seq,
                    self.detector.name(),
                    e
                );
                return FrameReport::default();
            }
        };
        let detections: Vec<Detection> = detections
            .into_iter()
            .filter(|d| match d.validate() {
                Ok(()) => true,
                Err(e) => {
                    log::debug!(
                        "camera {} frame {}: dropping detection: {:#}",
                        camera_id,
                        frame.seq,
                        e
                    );
                    false
                }
            })
            .collect();

        let outcomes = self.settings.rules.evaluate(&detections);
        let mut fired: Vec<&RuleOutcome> = Vec::new();
        for outcome in &outcomes {
            let transition = self
                .tracks
                .observe(outcome.track_id, outcome.rule, outcome.violating, now);
            if transition == Transition::Ended {
                log::debug!(
                    "camera {}: track {} {} violation ended",
                    camera_id,
                    outcome.track_id,
                    outcome.rule
                );
            }
            if self
                .debouncer
                .should_alert(&mut self.tracks, outcome.track_id, outcome.rule, transition, now)
            {
                fired.push(outcome);
            }
        }
        self.tracks.sweep(
            now,
            duration_ms(self.settings.grace),
            self.debouncer.cooldown_ms(),
        );

        let mut violating_tracks: Vec<_> = outcomes
            .iter()
            .filter(|o| o.violating)
            .map(|o| o.track_id)
            .collect();
        violating_tracks.sort_unstable();
        violating_tracks.dedup();

        let Frame { seq, image, .. } = frame;
        let mut image = image;
        annotate(
            &mut image,
            &self.settings.rules.zones,
            &detections,
            &outcomes,
            WorkerState::Streaming,
        );

        for outcome in &fired {
            let event = AlertEvent::from_outcome(
                camera_id,
                outcome,
                now,
                &self.zone_names,
                self.settings.snapshots,
            );
            log::warn!(
                "ALERT camera {} {} track {}: {}",
                camera_id,
                event.rule,
                event.track_id,
                event.detail.message
            );
            let snapshot = self
                .settings
                .snapshots
                .then(|| {
                    snapshot_image(&image, self.settings.snapshot_mode, outcome.evidence.person)
                });
            if self.alerts.send(AlertJob { event, snapshot }) {
                self.stats.alerts_emitted.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.alerts_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.frames.publish(AnnotatedFrame {
            camera_id,
            seq,
            captured_at_ms: now,
            image,
            state: WorkerState::Streaming,
            violators: violating_tracks.len(),
        });
        self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);

        FrameReport {
            detections: detections.len(),
            alerts: fired.len(),
            violators: violating_tracks.len(),
        }
    }

    /// Drive the state machine until shutdown or retries run out.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> WorkerStatsSnapshot {
        let camera_id = self.settings.camera_id;
        let mut backoff = Backoff::new(self.settings.backoff.clone());

        'outer: while !shutdown.is_triggered() {
            self.set_state(WorkerState::Connecting);
            match self.source.connect() {
                Ok(()) => {
                    self.set_state(WorkerState::Streaming);
                    loop {
                        if shutdown.is_triggered() {
                            break 'outer;
                        }
                        match self.source.next_frame() {
                            Ok(Some(frame)) => {
                                self.process_frame(frame);
                                backoff.reset();
                            }
                            Ok(None) => {
                                log::info!("camera {}: end of stream", camera_id);
                                break;
                            }
                            Err(e) => {
                                log::warn!("camera {}: read failed: {:#}", camera_id, e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => log::warn!("camera {}: connect failed: {:#}", camera_id, e),
            }

            self.source.disconnect();
            if shutdown.is_triggered() {
                break;
            }
            self.set_state(WorkerState::Reconnecting);
            let Some(delay) = backoff.next_delay() else {
                log::error!(
                    "camera {}: giving up after {} reconnect attempts",
                    camera_id,
                    backoff.attempt()
                );
                break;
            };
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            log::info!("camera {}: reconnecting in {:?}", camera_id, delay);
            if shutdown.wait(delay) {
                break;
            }
        }

        self.source.disconnect();
        self.set_state(WorkerState::Stopped);
        self.stats.snapshot()
    }

    /// Run on a dedicated thread named after the camera.
    pub fn spawn(self, shutdown: ShutdownSignal) -> Result<JoinHandle<WorkerStatsSnapshot>> {
        let camera_id = self.settings.camera_id;
        std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || self.run(&shutdown))
            .map_err(|e| anyhow!("spawn worker for camera {}: {}", camera_id, e))
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64, retries: Option<u32>) -> Backoff {
        Backoff::new(BackoffSettings {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
            max_retries: retries,
            jitter: 0.0,
        })
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = fixed(100, 500, None);
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().unwrap().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn backoff_stops_after_max_retries() {
        let mut b = fixed(1, 10, Some(2));
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut b = Backoff::new(BackoffSettings {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(60),
            max_retries: None,
            jitter: 0.2,
        });
        let d = b.next_delay().unwrap();
        assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
    }

    #[test]
    fn state_round_trips_through_atomic() {
        for state in [
            WorkerState::Disconnected,
            WorkerState::Connecting,
            WorkerState::Streaming,
            WorkerState::Reconnecting,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from_u8(state.to_u8()), state);
        }
    }
}
