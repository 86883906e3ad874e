use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use hazard_sentinel::config::SentinelConfig;
use hazard_sentinel::{ErrorKind, RuleKind, SnapshotMode};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTINEL_CONFIG",
        "SENTINEL_RTSP_SERVER",
        "SENTINEL_N_CAMS",
        "SENTINEL_DB_PATH",
        "SENTINEL_SNAPSHOT_DIR",
        "SENTINEL_ZONES_PATH",
        "SENTINEL_DETECTOR",
        "SENTINEL_RETENTION_DAYS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "rtsp_server": "rtsp://nvr.local:8554",
        "n_cams": 2,
        "db_path": "site.db",
        "detector": "replay:/tmp/dets.jsonl",
        "defaults": {"cooldown_ms": 3000, "snapshot_mode": "crop"},
        "pipeline": {"alert_queue_capacity": 16, "frame_buffer": 3},
        "reconnect": {"initial_backoff_ms": 200, "max_backoff_ms": 2000, "max_retries": 5},
        "retention": {"days": 7}
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("SENTINEL_CONFIG", file.path());
    std::env::set_var("SENTINEL_RTSP_SERVER", "rtsp://backup:8554/");
    std::env::set_var("SENTINEL_N_CAMS", "4");
    std::env::set_var("SENTINEL_RETENTION_DAYS", "14");

    let cfg = SentinelConfig::load().expect("load config");

    assert_eq!(cfg.cameras.len(), 4);
    assert_eq!(cfg.source_for(&cfg.cameras[3]), "rtsp://backup:8554/3");
    assert_eq!(cfg.db_path, "site.db");
    assert_eq!(cfg.detector, "replay:/tmp/dets.jsonl");
    assert_eq!(cfg.cameras[0].cooldown, Duration::from_secs(3));
    assert_eq!(cfg.cameras[0].snapshot_mode, SnapshotMode::Crop);
    assert_eq!(cfg.pipeline.alert_queue_capacity, 16);
    assert_eq!(cfg.pipeline.frame_buffer, 3);
    assert_eq!(cfg.reconnect.max_retries, Some(5));
    assert_eq!(cfg.retention, Duration::from_secs(14 * 24 * 3600));

    clear_env();
}

#[test]
fn loads_toml_config_with_camera_list() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp toml");
    let toml = r#"
        zones_path = "site_zones.json"

        [defaults]
        rules = ["danger_zone"]

        [[cameras]]
        id = 10
        source = "stub://gate"

        [[cameras]]
        id = 11
        rules = ["no_helmet"]
        require_head = true

        [classes]
        helmet = ["helmet", "hard_hat"]
    "#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("SENTINEL_CONFIG", file.path());
    // Explicit camera lists are not resized by the count override.
    std::env::set_var("SENTINEL_N_CAMS", "7");

    let cfg = SentinelConfig::load().expect("load toml");
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].id, 10);
    assert_eq!(cfg.cameras[0].rules, vec![RuleKind::DangerZone]);
    assert_eq!(cfg.source_for(&cfg.cameras[0]), "stub://gate");
    assert_eq!(cfg.source_for(&cfg.cameras[1]), "rtsp://localhost:8554/11");
    assert!(cfg.cameras[1].thresholds.require_head);
    assert_eq!(cfg.classes.helmet, vec!["helmet".to_string(), "hard_hat".to_string()]);

    clear_env();
}

#[test]
fn bad_numeric_override_is_a_configuration_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SENTINEL_N_CAMS", "three");
    let err = SentinelConfig::load().unwrap_err();
    assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);
    assert!(ErrorKind::classify(&err).is_fatal());

    clear_env();
}

#[test]
fn overflowing_retention_is_a_configuration_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SENTINEL_RETENTION_DAYS", "300000000000000");
    let err = SentinelConfig::load().unwrap_err();
    assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp json");
    file.write_all(br#"{"retention": {"days": 300000000000000}}"#)
        .expect("write config");
    std::env::set_var("SENTINEL_CONFIG", file.path());
    let err = SentinelConfig::load().unwrap_err();
    assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);

    clear_env();
}

#[test]
fn zone_file_is_required_only_when_danger_zone_is_enabled() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing_zones.json");
    std::env::set_var("SENTINEL_ZONES_PATH", &missing);
    let cfg = SentinelConfig::load().expect("load defaults");
    let err = cfg.load_zones().unwrap_err();
    assert_eq!(ErrorKind::classify(&err), ErrorKind::ConfigurationError);

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp json");
    file.write_all(br#"{"defaults": {"rules": ["no_helmet"]}}"#)
        .expect("write config");
    std::env::set_var("SENTINEL_CONFIG", file.path());
    let cfg = SentinelConfig::load().expect("load helmet-only");
    assert!(cfg.load_zones().expect("no zones needed").is_empty());

    let zones_path = dir.path().join("zones.json");
    std::fs::write(
        &zones_path,
        r#"{"0": [[0, 0], [100, 0], [100, 100]], "1": [[0, 0], [50, 0], [50, 50]], "2": [[1, 1], [9, 1], [9, 9]]}"#,
    )
    .expect("write zones");
    std::env::remove_var("SENTINEL_CONFIG");
    std::env::set_var("SENTINEL_ZONES_PATH", &zones_path);
    let cfg = SentinelConfig::load().expect("load defaults");
    assert_eq!(cfg.load_zones().expect("zones").len(), 3);

    clear_env();
}
