//! Hand-off of annotated frames from camera workers to the display loop.
//!
//! Each camera gets its own small bounded queue. When a queue is full the
//! oldest frame is discarded so a slow consumer never stalls detection
//! and always sees the newest frames. Frames of one camera stay in order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Select, Sender, TrySendError};

use crate::error::PipelineError;
use crate::frame::AnnotatedFrame;
use crate::worker::WorkerState;
use crate::CameraId;

type StateTable = Arc<Mutex<BTreeMap<CameraId, WorkerState>>>;

/// Consumer side: one receiver per camera plus the latest known states.
pub struct FrameAggregator {
    receivers: BTreeMap<CameraId, Receiver<AnnotatedFrame>>,
    states: StateTable,
    capacity: usize,
}

/// Producer side handed to one camera worker.
pub struct FramePublisher {
    camera_id: CameraId,
    tx: Sender<AnnotatedFrame>,
    evict: Receiver<AnnotatedFrame>,
    dropped: Arc<AtomicU64>,
    states: StateTable,
}

impl FrameAggregator {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("frame buffer capacity must be > 0"));
        }
        Ok(Self {
            receivers: BTreeMap::new(),
            states: Arc::new(Mutex::new(BTreeMap::new())),
            capacity,
        })
    }

    /// Register a camera and return its publisher.
    pub fn publisher(&mut self, camera_id: CameraId) -> FramePublisher {
        let (tx, rx) = crossbeam_channel::bounded(self.capacity);
        self.receivers.insert(camera_id, rx.clone());
        if let Ok(mut states) = self.states.lock() {
            states.insert(camera_id, WorkerState::Disconnected);
        }
        FramePublisher {
            camera_id,
            tx,
            evict: rx,
            dropped: Arc::new(AtomicU64::new(0)),
            states: Arc::clone(&self.states),
        }
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.receivers.keys().copied().collect()
    }

    /// Latest state reported by each camera's worker.
    pub fn states(&self) -> BTreeMap<CameraId, WorkerState> {
        match self.states.lock() {
            Ok(states) => states.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Wait up to `timeout` for a frame from any camera.
    ///
    /// Returns `None` on timeout or once every publisher is gone and all
    /// queues are empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<AnnotatedFrame> {
        if self.receivers.is_empty() {
            std::thread::sleep(timeout);
            return None;
        }
        let receivers: Vec<&Receiver<AnnotatedFrame>> = self.receivers.values().collect();
        let mut select = Select::new();
        for rx in receivers.iter() {
            select.recv(*rx);
        }
        let mut live = receivers.len();
        loop {
            let op = select.select_timeout(timeout).ok()?;
            let index = op.index();
            match op.recv(receivers[index]) {
                Ok(frame) => return Some(frame),
                // Publisher gone and queue drained; stop selecting on it.
                Err(_) => {
                    select.remove(index);
                    live -= 1;
                    if live == 0 {
                        return None;
                    }
                }
            }
        }
    }

    /// Everything currently queued, oldest first per camera.
    pub fn drain(&self) -> Vec<AnnotatedFrame> {
        self.receivers
            .values()
            .flat_map(|rx| rx.try_iter().collect::<Vec<_>>())
            .collect()
    }
}

impl FramePublisher {
    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Queue `frame`, discarding the oldest queued frame if the buffer is full.
    pub fn publish(&self, frame: AnnotatedFrame) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.evict.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    frame = returned;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    pub fn set_state(&self, state: WorkerState) {
        match self.states.lock() {
            Ok(mut states) => {
                states.insert(self.camera_id, state);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(self.camera_id, state);
            }
        }
    }

    /// Frames discarded by the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
