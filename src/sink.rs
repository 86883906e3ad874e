//! Alert sink.
//!
//! A single thread owns the `AlertStore` and consumes alert jobs from a
//! bounded queue shared by all camera workers. Writes are serialized
//! through the queue; workers never touch the store. A failed write is
//! logged and the event dropped. Workers enqueue with a short timeout and
//! drop the alert if the queue stays full, so a slow disk never stalls
//! detection.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::alert::AlertEvent;
use crate::error::PipelineError;
use crate::geometry::BBox;
use crate::storage::AlertStore;

/// What a snapshot shows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// The whole annotated frame.
    #[default]
    Frame,
    /// A padded crop around the violating person.
    Crop,
}

/// Padding around a cropped subject, as a fraction of its larger side.
const CROP_PADDING: f32 = 0.25;

/// Cut the snapshot image for an alert out of the annotated frame.
pub fn snapshot_image(frame: &RgbImage, mode: SnapshotMode, subject: Option<BBox>) -> RgbImage {
    let bbox = match (mode, subject) {
        (SnapshotMode::Crop, Some(bbox)) => bbox,
        _ => return frame.clone(),
    };
    let pad = bbox.w.max(bbox.h) * CROP_PADDING;
    let region = bbox.padded_within(pad, frame.width(), frame.height());
    let (x, y) = (region.x as u32, region.y as u32);
    let w = (region.w as u32).min(frame.width().saturating_sub(x));
    let h = (region.h as u32).min(frame.height().saturating_sub(y));
    if w == 0 || h == 0 {
        return frame.clone();
    }
    image::imageops::crop_imm(frame, x, y, w, h).to_image()
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| PipelineError::persistence(format!("jpeg encode: {}", e)))?;
    Ok(out.into_inner())
}

/// One unit of work for the sink.
#[derive(Debug)]
pub struct AlertJob {
    pub event: AlertEvent,
    pub snapshot: Option<RgbImage>,
}

#[derive(Debug, Default)]
struct SinkCounters {
    persisted: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub persisted: u64,
    /// Events dropped because the store rejected them.
    pub failed: u64,
    /// Events still queued when the drain deadline passed.
    pub discarded: u64,
}

impl SinkCounters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle given to each camera worker.
#[derive(Clone)]
pub struct AlertSender {
    tx: Sender<AlertJob>,
    enqueue_timeout: Duration,
}

impl AlertSender {
    /// Queue a job. Returns `false` when the job was dropped because the
    /// queue stayed full for the enqueue timeout or the sink is gone.
    pub fn send(&self, job: AlertJob) -> bool {
        match self.tx.send_timeout(job, self.enqueue_timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(job)) => {
                log::error!(
                    "alert queue full; dropping camera {} {} track {}",
                    job.event.camera_id,
                    job.event.rule,
                    job.event.track_id
                );
                false
            }
            Err(SendTimeoutError::Disconnected(job)) => {
                log::error!(
                    "alert sink stopped; dropping camera {} {} track {}",
                    job.event.camera_id,
                    job.event.rule,
                    job.event.track_id
                );
                false
            }
        }
    }
}

/// Owner handle for the sink thread.
pub struct AlertSinkHandle<S> {
    thread: JoinHandle<S>,
    deadline: Sender<Instant>,
    counters: Arc<SinkCounters>,
}

/// Periodic deletion of old alerts, run on the sink thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub interval: Duration,
}

pub struct AlertSink;

impl AlertSink {
    /// Spawn the sink thread over `store`.
    ///
    /// The thread runs until every `AlertSender` is dropped. Call
    /// `AlertSinkHandle::shutdown` after stopping the workers.
    pub fn spawn<S>(
        store: S,
        capacity: usize,
        enqueue_timeout: Duration,
    ) -> Result<(AlertSender, AlertSinkHandle<S>)>
    where
        S: AlertStore + 'static,
    {
        Self::spawn_with_retention(store, capacity, enqueue_timeout, None)
    }

    /// Like `spawn`, additionally pruning alerts older than the policy's
    /// age at startup and then every interval.
    pub fn spawn_with_retention<S>(
        store: S,
        capacity: usize,
        enqueue_timeout: Duration,
        retention: Option<RetentionPolicy>,
    ) -> Result<(AlertSender, AlertSinkHandle<S>)>
    where
        S: AlertStore + 'static,
    {
        if capacity == 0 {
            return Err(PipelineError::config("alert queue capacity must be > 0"));
        }
        if retention.is_some_and(|r| r.interval.is_zero()) {
            return Err(PipelineError::config("retention interval must be > 0"));
        }
        let (tx, rx) = crossbeam_channel::bounded::<AlertJob>(capacity);
        let (deadline_tx, deadline_rx) = crossbeam_channel::bounded::<Instant>(1);
        let counters = Arc::new(SinkCounters::default());
        let thread_counters = Arc::clone(&counters);
        let thread = std::thread::Builder::new()
            .name("alert-sink".to_string())
            .spawn(move || run_sink(store, rx, deadline_rx, &thread_counters, retention))
            .map_err(|e| anyhow!("spawn alert sink: {}", e))?;
        Ok((
            AlertSender { tx, enqueue_timeout },
            AlertSinkHandle {
                thread,
                deadline: deadline_tx,
                counters,
            },
        ))
    }
}

const IDLE_WAIT: Duration = Duration::from_secs(60);

fn run_sink<S: AlertStore>(
    mut store: S,
    rx: Receiver<AlertJob>,
    deadline_rx: Receiver<Instant>,
    counters: &SinkCounters,
    retention: Option<RetentionPolicy>,
) -> S {
    let mut deadline: Option<Instant> = None;
    let mut next_prune = retention.map(|_| Instant::now());
    loop {
        if let (Some(policy), Some(at)) = (retention, next_prune) {
            if Instant::now() >= at {
                prune(&mut store, policy);
                next_prune = Some(Instant::now() + policy.interval);
            }
        }
        let wait = next_prune
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);
        let job = match rx.recv_timeout(wait) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if deadline.is_none() {
            deadline = deadline_rx.try_recv().ok();
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            counters.discarded.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        persist(&mut store, job, counters);
    }
    let stats = counters.snapshot();
    log::info!(
        "alert sink drained: {} persisted, {} failed, {} discarded",
        stats.persisted,
        stats.failed,
        stats.discarded
    );
    store
}

fn prune<S: AlertStore>(store: &mut S, policy: RetentionPolicy) {
    let now = match crate::now_ms() {
        Ok(now) => now,
        Err(e) => {
            log::error!("retention: clock unavailable: {:#}", e);
            return;
        }
    };
    let max_age = u64::try_from(policy.max_age.as_millis()).unwrap_or(u64::MAX);
    match store.prune_older_than(now.saturating_sub(max_age)) {
        Ok(0) => {}
        Ok(n) => log::info!("retention: pruned {} alerts older than {:?}", n, policy.max_age),
        Err(e) => log::error!("retention: prune failed: {:#}", e),
    }
}

fn persist<S: AlertStore>(store: &mut S, job: AlertJob, counters: &SinkCounters) {
    let AlertJob { event, snapshot } = job;
    let bytes = match snapshot.as_ref().map(encode_jpeg).transpose() {
        Ok(bytes) => bytes,
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "dropping alert for camera {} track {}: {:#}",
                event.camera_id,
                event.track_id,
                e
            );
            return;
        }
    };
    match store.append(&event, bytes.as_deref()) {
        Ok(id) => {
            counters.persisted.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "alert {} stored ({} camera {} track {})",
                id,
                event.rule,
                event.camera_id,
                event.track_id
            );
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "dropping alert for camera {} track {}: {:#}",
                event.camera_id,
                event.track_id,
                e
            );
        }
    }
}

impl<S> AlertSinkHandle<S> {
    pub fn stats(&self) -> SinkStats {
        self.counters.snapshot()
    }

    /// Wait for the sink to drain. Jobs still queued after `drain_timeout`
    /// are discarded. Every `AlertSender` must already be dropped, or this
    /// blocks until they are.
    pub fn shutdown(self, drain_timeout: Duration) -> Result<(S, SinkStats)> {
        let _ = self.deadline.try_send(Instant::now() + drain_timeout);
        let store = self
            .thread
            .join()
            .map_err(|_| anyhow!("alert sink thread panicked"))?;
        Ok((store, self.counters.snapshot()))
    }
}
