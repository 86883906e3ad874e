//! Hazard Sentinel
//!
//! Multi-camera workplace safety monitoring. Each camera's frames pass
//! through an external detector/tracker, per-frame violation rules
//! (restricted zones, missing helmets), a per-track state store and an
//! alert debouncer. Alerts go to a single persistence thread; annotated
//! frames go to a display consumer.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> DetectorBackend -> RuleSet -> TrackStateStore/AlertDebouncer
//!                                                  |                 |
//!                                          AlertSink (1 thread)   FrameAggregator
//! ```
//!
//! One thread per camera (`worker`), one for the alert sink (`sink`); the
//! display loop runs wherever the caller puts it (`preview`). Camera
//! threads share nothing but the two queues.
//!
//! # Module Structure
//!
//! - `geometry`, `zones`: boxes, polygons and the zone file
//! - `detect`: detection types and detector backends
//! - `ingest`: frame sources (stub scene, RTSP via GStreamer)
//! - `rules`, `track_state`, `debounce`: violation logic
//! - `alert`, `storage`, `sink`: alert events and their persistence
//! - `aggregator`, `annotate`, `preview`: annotated frame hand-off and display
//! - `worker`, `shutdown`: per-camera pipeline and lifecycle
//! - `config`, `error`: configuration and error taxonomy

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod aggregator;
pub mod alert;
pub mod annotate;
pub mod config;
pub mod debounce;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod preview;
pub mod rules;
pub mod shutdown;
pub mod sink;
pub mod storage;
pub mod track_state;
pub mod worker;
pub mod zones;

/// Camera identifier, unique within a deployment.
pub type CameraId = u32;
/// Tracker-assigned identity, unique within one camera's stream.
pub type TrackId = u64;

pub use aggregator::{FrameAggregator, FramePublisher};
pub use alert::{AlertDetail, AlertEvent};
pub use config::SentinelConfig;
pub use debounce::AlertDebouncer;
pub use detect::{BackendRegistry, ClassMap, Detection, DetectorBackend, ObjectClass};
pub use error::{ErrorKind, PipelineError};
pub use frame::{AnnotatedFrame, Frame};
pub use geometry::{BBox, Point, Polygon};
pub use ingest::{FrameSource, RtspConfig, RtspSource};
pub use rules::{AnchorPoint, RuleKind, RuleOutcome, RuleSet, RuleThresholds};
pub use shutdown::ShutdownSignal;
pub use sink::{AlertJob, AlertSender, AlertSink, AlertSinkHandle, SinkStats, SnapshotMode};
pub use storage::{AlertId, AlertStore, InMemoryAlertStore, SqliteAlertStore, StoredAlert};
pub use track_state::{TrackRecord, TrackStateStore, Transition};
pub use worker::{CameraWorker, WorkerSettings, WorkerState, WorkerStats, WorkerStatsSnapshot};
pub use zones::{Zone, ZoneMap};

/// URI for a private in-memory SQLite database shared across connections.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:hazard_sentinel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(u64::try_from(elapsed.as_millis())?)
}
