use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::ClassMap;
use crate::error::PipelineError;
use crate::rules::{AnchorPoint, RuleKind, RuleSet, RuleThresholds};
use crate::sink::SnapshotMode;
use crate::worker::{BackoffSettings, WorkerSettings};
use crate::zones::ZoneMap;
use crate::CameraId;

const DEFAULT_RTSP_SERVER: &str = "rtsp://localhost:8554";
const DEFAULT_N_CAMS: u32 = 3;
const DEFAULT_DB_PATH: &str = "alerts/alerts.db";
const DEFAULT_SNAPSHOT_DIR: &str = "alerts/snapshots";
const DEFAULT_PREVIEW_DIR: &str = "alerts/preview";
const DEFAULT_ZONES_PATH: &str = "danger_zones.json";
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_FPS: u32 = 10;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_COOLDOWN_MS: u64 = 10_000;
const DEFAULT_GRACE_MS: u64 = 5_000;
const DEFAULT_RETENTION_DAYS: u64 = 30;
const SECS_PER_DAY: u64 = 24 * 60 * 60;
const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 60 * 60;
const DEFAULT_ALERT_QUEUE: usize = 64;
const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 50;
const DEFAULT_FRAME_BUFFER: usize = 2;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PREVIEW_INTERVAL_MS: u64 = 500;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct SentinelConfigFile {
    rtsp_server: Option<String>,
    n_cams: Option<u32>,
    db_path: Option<String>,
    snapshot_dir: Option<PathBuf>,
    preview_dir: Option<PathBuf>,
    zones_path: Option<PathBuf>,
    detector: Option<String>,
    frame: Option<FrameConfigFile>,
    defaults: Option<CameraConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
    classes: Option<ClassesConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct CameraConfigFile {
    id: Option<CameraId>,
    source: Option<String>,
    detector: Option<String>,
    rules: Option<Vec<String>>,
    person_min_confidence: Option<f32>,
    head_min_confidence: Option<f32>,
    helmet_min_confidence: Option<f32>,
    helmet_overlap_min: Option<f32>,
    head_region_ratio: Option<f32>,
    require_head: Option<bool>,
    anchor: Option<AnchorPoint>,
    cooldown_ms: Option<u64>,
    grace_ms: Option<u64>,
    snapshots: Option<bool>,
    snapshot_mode: Option<SnapshotMode>,
}

#[derive(Debug, Deserialize, Default)]
struct ClassesConfigFile {
    person: Option<Vec<String>>,
    head: Option<Vec<String>>,
    helmet: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    alert_queue_capacity: Option<usize>,
    alert_enqueue_timeout_ms: Option<u64>,
    frame_buffer: Option<usize>,
    drain_timeout_ms: Option<u64>,
    preview_interval_ms: Option<u64>,
    health_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_retries: Option<u32>,
    jitter: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    days: Option<u64>,
    prune_interval_secs: Option<u64>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub rtsp_server: String,
    pub db_path: String,
    pub snapshot_dir: PathBuf,
    pub preview_dir: PathBuf,
    pub zones_path: PathBuf,
    /// Default detector model reference (`stub`, `replay:<path>`).
    pub detector: String,
    pub frame: FrameSettings,
    /// Template for cameras generated from a count.
    pub defaults: CameraSettings,
    pub cameras: Vec<CameraSettings>,
    pub classes: ClassMap,
    pub pipeline: PipelineSettings,
    pub reconnect: BackoffSettings,
    pub retention: Duration,
    pub prune_interval: Duration,
    explicit_cameras: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameSettings {
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub id: CameraId,
    /// Explicit source locator; otherwise `{rtsp_server}/{id}`.
    pub source: Option<String>,
    /// Detector override for this camera.
    pub detector: Option<String>,
    pub rules: Vec<RuleKind>,
    pub thresholds: RuleThresholds,
    pub cooldown: Duration,
    pub grace: Duration,
    pub snapshots: bool,
    pub snapshot_mode: SnapshotMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub alert_queue_capacity: usize,
    pub alert_enqueue_timeout: Duration,
    pub frame_buffer: usize,
    pub drain_timeout: Duration,
    pub preview_interval: Duration,
    pub health_interval: Duration,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            id: 0,
            source: None,
            detector: None,
            rules: RuleKind::ALL.to_vec(),
            thresholds: RuleThresholds::default(),
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            snapshots: true,
            snapshot_mode: SnapshotMode::Frame,
        }
    }
}

impl CameraSettings {
    fn overlay(base: &CameraSettings, file: &CameraConfigFile) -> Result<Self> {
        let rules = match &file.rules {
            Some(names) => names
                .iter()
                .map(|name| RuleKind::parse(name))
                .collect::<Result<Vec<_>>>()?,
            None => base.rules.clone(),
        };
        let t = &base.thresholds;
        Ok(Self {
            id: file.id.unwrap_or(base.id),
            source: file.source.clone().or_else(|| base.source.clone()),
            detector: file.detector.clone().or_else(|| base.detector.clone()),
            rules,
            thresholds: RuleThresholds {
                person_min_confidence: file
                    .person_min_confidence
                    .unwrap_or(t.person_min_confidence),
                head_min_confidence: file.head_min_confidence.unwrap_or(t.head_min_confidence),
                helmet_min_confidence: file
                    .helmet_min_confidence
                    .unwrap_or(t.helmet_min_confidence),
                helmet_overlap_min: file.helmet_overlap_min.unwrap_or(t.helmet_overlap_min),
                head_region_ratio: file.head_region_ratio.unwrap_or(t.head_region_ratio),
                require_head: file.require_head.unwrap_or(t.require_head),
                anchor: file.anchor.unwrap_or(t.anchor),
            },
            cooldown: file.cooldown_ms.map(Duration::from_millis).unwrap_or(base.cooldown),
            grace: file.grace_ms.map(Duration::from_millis).unwrap_or(base.grace),
            snapshots: file.snapshots.unwrap_or(base.snapshots),
            snapshot_mode: file.snapshot_mode.unwrap_or(base.snapshot_mode),
        })
    }

    fn numbered(template: &CameraSettings, n: u32) -> Vec<CameraSettings> {
        (0..n)
            .map(|id| CameraSettings {
                id,
                ..template.clone()
            })
            .collect()
    }
}

impl SentinelConfig {
    /// Load from `SENTINEL_CONFIG` (if set), then environment overrides,
    /// then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults, validated.
    pub fn defaults() -> Result<Self> {
        let mut cfg = Self::from_file(SentinelConfigFile::default())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentinelConfigFile) -> Result<Self> {
        let defaults = match &file.defaults {
            Some(d) => CameraSettings::overlay(&CameraSettings::default(), d)?,
            None => CameraSettings::default(),
        };
        let (cameras, explicit_cameras) = match &file.cameras {
            Some(list) => {
                let mut cameras = Vec::with_capacity(list.len());
                for (idx, entry) in list.iter().enumerate() {
                    let base = CameraSettings {
                        id: idx as CameraId,
                        ..defaults.clone()
                    };
                    cameras.push(CameraSettings::overlay(&base, entry)?);
                }
                (cameras, true)
            }
            None => (
                CameraSettings::numbered(&defaults, file.n_cams.unwrap_or(DEFAULT_N_CAMS)),
                false,
            ),
        };

        let frame = file.frame.unwrap_or_default();
        let classes = file.classes.unwrap_or_default();
        let class_defaults = ClassMap::default();
        let pipeline = file.pipeline.unwrap_or_default();
        let reconnect = file.reconnect.unwrap_or_default();
        let reconnect_defaults = BackoffSettings::default();
        let retention = file.retention.unwrap_or_default();

        Ok(Self {
            rtsp_server: file
                .rtsp_server
                .unwrap_or_else(|| DEFAULT_RTSP_SERVER.to_string()),
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            snapshot_dir: file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            preview_dir: file
                .preview_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PREVIEW_DIR)),
            zones_path: file
                .zones_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ZONES_PATH)),
            detector: file.detector.unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            frame: FrameSettings {
                target_fps: frame.target_fps.unwrap_or(DEFAULT_FPS),
                width: frame.width.unwrap_or(DEFAULT_WIDTH),
                height: frame.height.unwrap_or(DEFAULT_HEIGHT),
            },
            defaults,
            cameras,
            classes: ClassMap {
                person: classes.person.unwrap_or(class_defaults.person),
                head: classes.head.unwrap_or(class_defaults.head),
                helmet: classes.helmet.unwrap_or(class_defaults.helmet),
            },
            pipeline: PipelineSettings {
                alert_queue_capacity: pipeline.alert_queue_capacity.unwrap_or(DEFAULT_ALERT_QUEUE),
                alert_enqueue_timeout: Duration::from_millis(
                    pipeline
                        .alert_enqueue_timeout_ms
                        .unwrap_or(DEFAULT_ENQUEUE_TIMEOUT_MS),
                ),
                frame_buffer: pipeline.frame_buffer.unwrap_or(DEFAULT_FRAME_BUFFER),
                drain_timeout: Duration::from_millis(
                    pipeline.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
                ),
                preview_interval: Duration::from_millis(
                    pipeline
                        .preview_interval_ms
                        .unwrap_or(DEFAULT_PREVIEW_INTERVAL_MS),
                ),
                health_interval: Duration::from_secs(
                    pipeline
                        .health_interval_secs
                        .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
                ),
            },
            reconnect: BackoffSettings {
                initial: reconnect
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(reconnect_defaults.initial),
                max: reconnect
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(reconnect_defaults.max),
                max_retries: reconnect.max_retries.or(reconnect_defaults.max_retries),
                jitter: reconnect.jitter.unwrap_or(reconnect_defaults.jitter),
            },
            retention: retention_from_days(retention.days.unwrap_or(DEFAULT_RETENTION_DAYS))?,
            prune_interval: Duration::from_secs(
                retention
                    .prune_interval_secs
                    .unwrap_or(DEFAULT_PRUNE_INTERVAL_SECS),
            ),
            explicit_cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(server) = std::env::var("SENTINEL_RTSP_SERVER") {
            if !server.trim().is_empty() {
                self.rtsp_server = server.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(n) = std::env::var("SENTINEL_N_CAMS") {
            let n: u32 = n.trim().parse().map_err(|_| {
                PipelineError::config("SENTINEL_N_CAMS must be a non-negative integer")
            })?;
            if self.explicit_cameras {
                log::warn!(
                    "SENTINEL_N_CAMS ignored: cameras are listed explicitly in the config file"
                );
            } else {
                self.cameras = CameraSettings::numbered(&self.defaults, n);
            }
        }
        if let Ok(path) = std::env::var("SENTINEL_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_SNAPSHOT_DIR") {
            if !dir.trim().is_empty() {
                self.snapshot_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("SENTINEL_ZONES_PATH") {
            if !path.trim().is_empty() {
                self.zones_path = PathBuf::from(path);
            }
        }
        if let Ok(detector) = std::env::var("SENTINEL_DETECTOR") {
            if !detector.trim().is_empty() {
                self.detector = detector.trim().to_string();
            }
        }
        if let Ok(days) = std::env::var("SENTINEL_RETENTION_DAYS") {
            let days: u64 = days.trim().parse().map_err(|_| {
                PipelineError::config("SENTINEL_RETENTION_DAYS must be an integer number of days")
            })?;
            self.retention = retention_from_days(days)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(PipelineError::config("at least one camera must be configured"));
        }
        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(PipelineError::config(format!("duplicate camera id {}", camera.id)));
            }
            camera.thresholds.validate().map_err(|e| {
                PipelineError::config(format!("camera {}: {:#}", camera.id, e))
            })?;
            if let Some(source) = &camera.source {
                if source.trim().is_empty() {
                    return Err(PipelineError::config(format!(
                        "camera {}: empty source",
                        camera.id
                    )));
                }
            }
        }
        self.classes = self.classes.normalized()?;

        if self.frame.target_fps == 0 || self.frame.width == 0 || self.frame.height == 0 {
            return Err(PipelineError::config("frame fps, width and height must be > 0"));
        }
        if self.pipeline.alert_queue_capacity == 0 {
            return Err(PipelineError::config("pipeline.alert_queue_capacity must be > 0"));
        }
        if self.pipeline.frame_buffer == 0 {
            return Err(PipelineError::config("pipeline.frame_buffer must be > 0"));
        }
        if self.pipeline.preview_interval.is_zero() || self.pipeline.health_interval.is_zero() {
            return Err(PipelineError::config("preview and health intervals must be > 0"));
        }
        if self.reconnect.initial.is_zero() || self.reconnect.max < self.reconnect.initial {
            return Err(PipelineError::config(
                "reconnect backoff must satisfy 0 < initial <= max",
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(PipelineError::config("reconnect.jitter must be within [0, 1]"));
        }
        if self.retention.is_zero() {
            return Err(PipelineError::config("retention must be greater than zero"));
        }
        if self.prune_interval.is_zero() {
            return Err(PipelineError::config("retention.prune_interval_secs must be > 0"));
        }
        if self.db_path.trim().is_empty() {
            return Err(PipelineError::config("db_path must not be empty"));
        }
        Ok(())
    }

    /// Source locator for `camera`.
    pub fn source_for(&self, camera: &CameraSettings) -> String {
        camera
            .source
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.rtsp_server, camera.id))
    }

    pub fn detector_for<'a>(&'a self, camera: &'a CameraSettings) -> &'a str {
        camera.detector.as_deref().unwrap_or(&self.detector)
    }

    fn needs_zones(&self) -> bool {
        self.cameras
            .iter()
            .any(|c| c.rules.contains(&RuleKind::DangerZone))
    }

    /// Load and check the zone file against the camera list.
    ///
    /// A missing file is only an error when some camera enables
    /// `danger_zone`.
    pub fn load_zones(&self) -> Result<ZoneMap> {
        let zones = if self.zones_path.exists() {
            ZoneMap::load(&self.zones_path)?
        } else if self.needs_zones() {
            return Err(PipelineError::config(format!(
                "zone file {} not found but danger_zone is enabled",
                self.zones_path.display()
            )));
        } else {
            ZoneMap::default()
        };
        self.validate_zones(&zones)?;
        Ok(zones)
    }

    pub fn validate_zones(&self, zones: &ZoneMap) -> Result<()> {
        for camera in &self.cameras {
            if camera.rules.contains(&RuleKind::DangerZone)
                && zones.for_camera(camera.id).is_empty()
            {
                return Err(PipelineError::config(format!(
                    "camera {} enables danger_zone but has no zones",
                    camera.id
                )));
            }
        }
        for id in zones.camera_ids() {
            if !self.cameras.iter().any(|c| c.id == id) {
                log::warn!("zones defined for unknown camera {}", id);
            }
        }
        Ok(())
    }

    pub fn worker_settings(&self, camera: &CameraSettings, zones: &ZoneMap) -> WorkerSettings {
        let rules = RuleSet::new(
            camera.rules.clone(),
            zones.for_camera(camera.id).to_vec(),
            camera.thresholds.clone(),
        );
        WorkerSettings {
            camera_id: camera.id,
            rules,
            cooldown: camera.cooldown,
            grace: camera.grace,
            snapshots: camera.snapshots,
            snapshot_mode: camera.snapshot_mode,
            backoff: self.reconnect.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentinelConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let parsed: std::result::Result<SentinelConfigFile, String> = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        PipelineError::config(format!("invalid config file {}: {}", path.display(), e))
    })
}

fn retention_from_days(days: u64) -> Result<Duration> {
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| {
            PipelineError::config(format!("retention of {} days is out of range", days))
        })
}
