use tempfile::TempDir;

use hazard_sentinel::alert::snapshot_name;
use hazard_sentinel::{AlertDetail, AlertEvent, AlertStore, RuleKind, SqliteAlertStore};

fn open_store() -> (TempDir, SqliteAlertStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("db").join("alerts.db");
    let db = db.to_str().expect("utf8 path");
    let store = SqliteAlertStore::open(db, dir.path().join("snapshots")).expect("open store");
    (dir, store)
}

fn alert(camera_id: u32, rule: RuleKind, track_id: u64, timestamp_ms: u64) -> AlertEvent {
    AlertEvent {
        camera_id,
        rule,
        track_id,
        timestamp_ms,
        snapshot_ref: Some(snapshot_name(camera_id, rule, track_id, timestamp_ms)),
        detail: AlertDetail {
            message: format!("camera {} track {}", camera_id, track_id),
            confidence: 0.8,
            ..AlertDetail::default()
        },
    }
}

#[test]
fn recent_alerts_are_limited_filtered_and_newest_first() {
    let (_dir, mut store) = open_store();
    // Interleave cameras and insert out of timestamp order.
    for i in 0..15u64 {
        let ts = 10_000 + (i * 7919) % 1000;
        store
            .append(&alert(0, RuleKind::DangerZone, i, ts), Some(b"jpeg"))
            .expect("append cam0");
        store
            .append(&alert(1, RuleKind::NoHelmet, i, ts + 1), None)
            .expect("append cam1");
    }

    let recent = store.get_recent_alerts(Some(0), 10).expect("query");
    assert_eq!(recent.len(), 10);
    assert!(recent.iter().all(|a| a.event.camera_id == 0));
    assert!(recent
        .windows(2)
        .all(|w| w[0].event.timestamp_ms >= w[1].event.timestamp_ms));

    let all = store.get_recent_alerts(None, 100).expect("query all");
    assert_eq!(all.len(), 30);
    assert!(all.iter().any(|a| a.event.camera_id == 1));

    assert!(store.get_recent_alerts(Some(9), 10).expect("query cam9").is_empty());
    assert!(store.get_recent_alerts(Some(0), 0).expect("limit 0").is_empty());
}

#[test]
fn stored_alerts_survive_reopen_with_snapshot_digest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = dir.path().join("alerts.db");
    let db = db.to_str().expect("utf8 path");
    let snaps = dir.path().join("snapshots");
    let event = alert(2, RuleKind::NoHelmet, 44, 1_700_000_000_000);
    {
        let mut store = SqliteAlertStore::open(db, snaps.clone()).expect("open");
        store.append(&event, Some(b"\xFF\xD8snapshot")).expect("append");
    }

    let mut store = SqliteAlertStore::open(db, snaps).expect("reopen");
    let recent = store.get_recent_alerts(Some(2), 1).expect("query");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].event, event);
    let digest = recent[0].snapshot_sha256.as_deref().expect("digest");
    assert_eq!(digest.len(), 64);
    let path = store.snapshot_path(event.snapshot_ref.as_deref().expect("snapshot ref"));
    assert_eq!(std::fs::read(path).expect("snapshot file"), b"\xFF\xD8snapshot");
}
