use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::alert::{AlertDetail, AlertEvent};
use crate::error::PipelineError;
use crate::rules::RuleKind;
use crate::{open_db_connection, CameraId};

/// Row id assigned by the store.
pub type AlertId = i64;

/// An alert as read back from a store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredAlert {
    pub id: AlertId,
    pub event: AlertEvent,
    /// Hex SHA-256 of the snapshot bytes, when a snapshot was stored.
    pub snapshot_sha256: Option<String>,
}

/// Append-only alert record store.
///
/// Only the alert sink writes to a store; readers (the query CLI, tests)
/// open their own handle.
pub trait AlertStore: Send {
    /// Persist `event`, and `snapshot` at the path named by
    /// `event.snapshot_ref`. Failures are `PersistenceFailure`.
    fn append(&mut self, event: &AlertEvent, snapshot: Option<&[u8]>) -> Result<AlertId>;

    /// Most recent first (timestamp, then insertion order), at most `limit`.
    fn get_recent_alerts(
        &mut self,
        camera_id: Option<CameraId>,
        limit: usize,
    ) -> Result<Vec<StoredAlert>>;

    /// Delete alerts older than `cutoff_ms`. Returns the number removed.
    fn prune_older_than(&mut self, cutoff_ms: u64) -> Result<usize>;
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

pub struct SqliteAlertStore {
    conn: Connection,
    snapshot_dir: PathBuf,
}

impl SqliteAlertStore {
    pub fn open(db_path: &str, snapshot_dir: impl Into<PathBuf>) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !db_path.starts_with("file:") && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PipelineError::persistence(format!(
                        "create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = open_db_connection(db_path)
            .map_err(|e| PipelineError::persistence(format!("open {}: {}", db_path, e)))?;
        let mut store = Self {
            conn,
            snapshot_dir: snapshot_dir.into(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id INTEGER NOT NULL,
              rule TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              snapshot_path TEXT,
              snapshot_sha256 TEXT,
              detail_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_camera_ts ON alerts(camera_id, timestamp_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Absolute location of a snapshot reference.
    pub fn snapshot_path(&self, snapshot_ref: &str) -> PathBuf {
        self.snapshot_dir.join(snapshot_ref)
    }

    fn write_snapshot(&self, snapshot_ref: &str, bytes: &[u8]) -> Result<String> {
        std::fs::create_dir_all(&self.snapshot_dir).map_err(|e| {
            PipelineError::persistence(format!(
                "create snapshot dir {}: {}",
                self.snapshot_dir.display(),
                e
            ))
        })?;
        let path = self.snapshot_path(snapshot_ref);
        std::fs::write(&path, bytes).map_err(|e| {
            PipelineError::persistence(format!("write snapshot {}: {}", path.display(), e))
        })?;
        Ok(sha256_hex(bytes))
    }
}

impl AlertStore for SqliteAlertStore {
    fn append(&mut self, event: &AlertEvent, snapshot: Option<&[u8]>) -> Result<AlertId> {
        let timestamp_ms = to_i64(event.timestamp_ms, "alert timestamp")?;
        let track_id = to_i64(event.track_id, "track id")?;
        let detail_json = serde_json::to_string(&event.detail)?;

        let (snapshot_path, snapshot_sha256) = match (event.snapshot_ref.as_deref(), snapshot) {
            (Some(name), Some(bytes)) => (Some(name), Some(self.write_snapshot(name, bytes)?)),
            _ => (None, None),
        };

        let inserted = self.conn.execute(
            r#"
            INSERT INTO alerts(
              camera_id, rule, track_id, timestamp_ms,
              snapshot_path, snapshot_sha256, detail_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.camera_id as i64,
                event.rule.as_str(),
                track_id,
                timestamp_ms,
                snapshot_path,
                snapshot_sha256,
                detail_json
            ],
        );
        if let Err(e) = inserted {
            // No row references the snapshot now.
            if let Some(name) = snapshot_path {
                let path = self.snapshot_path(name);
                if let Err(rm) = std::fs::remove_file(&path) {
                    log::warn!("remove orphaned snapshot {}: {}", path.display(), rm);
                }
            }
            return Err(PipelineError::persistence(format!("insert alert: {}", e)));
        }

        Ok(self.conn.last_insert_rowid())
    }

    fn get_recent_alerts(
        &mut self,
        camera_id: Option<CameraId>,
        limit: usize,
    ) -> Result<Vec<StoredAlert>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, camera_id, rule, track_id, timestamp_ms,
                   snapshot_path, snapshot_sha256, detail_json
            FROM alerts
            WHERE (?1 IS NULL OR camera_id = ?1)
            ORDER BY timestamp_ms DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let mut rows = stmt.query(params![camera_id.map(i64::from), limit])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let camera: i64 = row.get(1)?;
            let rule: String = row.get(2)?;
            let track: i64 = row.get(3)?;
            let ts: i64 = row.get(4)?;
            let snapshot_ref: Option<String> = row.get(5)?;
            let snapshot_sha256: Option<String> = row.get(6)?;
            let detail_json: String = row.get(7)?;

            let detail: AlertDetail = serde_json::from_str(&detail_json)
                .map_err(|e| anyhow!("corrupt alert {}: detail_json: {}", id, e))?;
            out.push(StoredAlert {
                id,
                event: AlertEvent {
                    camera_id: CameraId::try_from(camera)
                        .map_err(|_| anyhow!("corrupt alert {}: camera_id {}", id, camera))?,
                    rule: RuleKind::parse(&rule)?,
                    track_id: u64::try_from(track)
                        .map_err(|_| anyhow!("corrupt alert {}: track_id {}", id, track))?,
                    timestamp_ms: u64::try_from(ts)
                        .map_err(|_| anyhow!("corrupt alert {}: timestamp {}", id, ts))?,
                    snapshot_ref,
                    detail,
                },
                snapshot_sha256,
            });
        }
        Ok(out)
    }

    fn prune_older_than(&mut self, cutoff_ms: u64) -> Result<usize> {
        let cutoff = to_i64(cutoff_ms, "cutoff")?;
        let snapshots = {
            let mut stmt = self.conn.prepare(
                "SELECT snapshot_path FROM alerts \
                 WHERE timestamp_ms < ?1 AND snapshot_path IS NOT NULL",
            )?;
            let mut rows = stmt.query(params![cutoff])?;
            let mut names = Vec::new();
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                names.push(name);
            }
            names
        };

        let removed = self
            .conn
            .execute("DELETE FROM alerts WHERE timestamp_ms < ?1", params![cutoff])?;

        for name in snapshots {
            let path = self.snapshot_path(&name);
            if let Err(e) = std::fs::remove_file(&path) {
                log::debug!("retention: could not remove {}: {}", path.display(), e);
            }
        }
        Ok(removed)
    }
}

impl SqliteAlertStore {
    /// Digest recorded for an alert's snapshot, if any.
    pub fn snapshot_digest(&self, id: AlertId) -> Result<Option<String>> {
        let digest: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT snapshot_sha256 FROM alerts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest.flatten())
    }
}

/// Store kept entirely in memory. Snapshots are held by reference name.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAlertStore {
    alerts: Vec<StoredAlert>,
    snapshots: std::collections::BTreeMap<String, Vec<u8>>,
    next_id: AlertId,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn snapshot(&self, snapshot_ref: &str) -> Option<&[u8]> {
        self.snapshots.get(snapshot_ref).map(Vec::as_slice)
    }
}

impl AlertStore for InMemoryAlertStore {
    fn append(&mut self, event: &AlertEvent, snapshot: Option<&[u8]>) -> Result<AlertId> {
        self.next_id += 1;
        let mut event = event.clone();
        let snapshot_sha256 = match (event.snapshot_ref.as_ref(), snapshot) {
            (Some(name), Some(bytes)) => {
                self.snapshots.insert(name.clone(), bytes.to_vec());
                Some(sha256_hex(bytes))
            }
            _ => {
                event.snapshot_ref = None;
                None
            }
        };
        self.alerts.push(StoredAlert {
            id: self.next_id,
            event,
            snapshot_sha256,
        });
        Ok(self.next_id)
    }

    fn get_recent_alerts(
        &mut self,
        camera_id: Option<CameraId>,
        limit: usize,
    ) -> Result<Vec<StoredAlert>> {
        let mut out: Vec<StoredAlert> = self
            .alerts
            .iter()
            .filter(|a| camera_id.map_or(true, |c| a.event.camera_id == c))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.event
                .timestamp_ms
                .cmp(&a.event.timestamp_ms)
                .then(b.id.cmp(&a.id))
        });
        out.truncate(limit);
        Ok(out)
    }

    fn prune_older_than(&mut self, cutoff_ms: u64) -> Result<usize> {
        let before = self.alerts.len();
        let snapshots = &mut self.snapshots;
        self.alerts.retain(|a| {
            let keep = a.event.timestamp_ms >= cutoff_ms;
            if !keep {
                if let Some(name) = &a.event.snapshot_ref {
                    snapshots.remove(name);
                }
            }
            keep
        });
        Ok(before - self.alerts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn event(camera_id: CameraId, track_id: u64, ts: u64) -> AlertEvent {
        AlertEvent {
            camera_id,
            rule: RuleKind::DangerZone,
            track_id,
            timestamp_ms: ts,
            snapshot_ref: Some(crate::alert::snapshot_name(
                camera_id,
                RuleKind::DangerZone,
                track_id,
                ts,
            )),
            detail: AlertDetail {
                message: "entered".to_string(),
                confidence: 0.9,
                ..AlertDetail::default()
            },
        }
    }

    #[test]
    fn sqlite_store_writes_rows_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alerts.db");
        let mut store =
            SqliteAlertStore::open(db.to_str().unwrap(), dir.path().join("snaps")).unwrap();

        let ev = event(0, 5, 1_000);
        let id = store.append(&ev, Some(b"jpeg-bytes")).unwrap();
        let path = store.snapshot_path(ev.snapshot_ref.as_deref().unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");
        assert_eq!(store.snapshot_digest(id).unwrap(), Some(sha256_hex(b"jpeg-bytes")));

        let recent = store.get_recent_alerts(Some(0), 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event, ev);
    }

    #[test]
    fn failed_insert_removes_its_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alerts.db");
        let mut store =
            SqliteAlertStore::open(db.to_str().unwrap(), dir.path().join("snaps")).unwrap();
        store.conn.execute_batch("DROP TABLE alerts;").unwrap();

        let ev = event(1, 9, 2_000);
        let err = store.append(&ev, Some(b"jpeg-bytes")).unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::PersistenceFailure);
        assert!(!store.snapshot_path(ev.snapshot_ref.as_deref().unwrap()).exists());
    }

    #[test]
    fn sqlite_store_without_snapshot_leaves_path_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alerts.db");
        let mut store =
            SqliteAlertStore::open(db.to_str().unwrap(), dir.path().join("snaps")).unwrap();
        store.append(&event(1, 2, 10), None).unwrap();
        let recent = store.get_recent_alerts(None, 10).unwrap();
        assert!(recent[0].event.snapshot_ref.is_none());
        assert!(recent[0].snapshot_sha256.is_none());
    }

    #[test]
    fn snapshot_write_failure_is_persistence_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let db = dir.path().join("alerts.db");
        let mut store = SqliteAlertStore::open(db.to_str().unwrap(), &blocker).unwrap();
        let err = store.append(&event(0, 1, 1), Some(b"img")).unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::PersistenceFailure);
        assert!(store.get_recent_alerts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn prune_removes_old_rows_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("alerts.db");
        let mut store =
            SqliteAlertStore::open(db.to_str().unwrap(), dir.path().join("snaps")).unwrap();
        let old = event(0, 1, 100);
        store.append(&old, Some(b"old")).unwrap();
        store.append(&event(0, 2, 5_000), Some(b"new")).unwrap();

        assert_eq!(store.prune_older_than(1_000).unwrap(), 1);
        assert!(!store.snapshot_path(old.snapshot_ref.as_deref().unwrap()).exists());
        let left = store.get_recent_alerts(None, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event.track_id, 2);
    }

    #[test]
    fn shared_memory_database_is_visible_to_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let uri = crate::shared_memory_uri();
        let mut writer = SqliteAlertStore::open(&uri, dir.path()).unwrap();
        let mut reader = SqliteAlertStore::open(&uri, dir.path()).unwrap();
        writer.append(&event(3, 1, 50), None).unwrap();
        assert_eq!(reader.get_recent_alerts(Some(3), 5).unwrap().len(), 1);
    }

    #[test]
    fn in_memory_store_orders_and_filters() {
        let mut store = InMemoryAlertStore::new();
        store.append(&event(0, 1, 10), None).unwrap();
        store.append(&event(1, 2, 30), None).unwrap();
        store.append(&event(0, 3, 20), Some(b"s")).unwrap();
        store.append(&event(0, 4, 20), None).unwrap();

        let cam0 = store.get_recent_alerts(Some(0), 10).unwrap();
        let tracks: Vec<u64> = cam0.iter().map(|a| a.event.track_id).collect();
        assert_eq!(tracks, vec![4, 3, 1]);
        assert_eq!(store.get_recent_alerts(None, 2).unwrap().len(), 2);
        assert!(store.snapshot("cam0_danger_zone_track3_20.jpg").is_some());

        assert_eq!(store.prune_older_than(25).unwrap(), 3);
        assert!(store.snapshot("cam0_danger_zone_track3_20.jpg").is_none());
        assert_eq!(store.len(), 1);
    }
}
