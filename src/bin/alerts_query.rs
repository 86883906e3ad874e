//! alerts_query - list the most recent stored alerts

use anyhow::Result;
use clap::Parser;
use serde::Serialize;

use hazard_sentinel::{AlertStore, SqliteAlertStore, StoredAlert};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the alert database.
    #[arg(long, env = "SENTINEL_DB_PATH", default_value = "alerts/alerts.db")]
    db_path: String,
    /// Snapshot directory used to resolve snapshot paths.
    #[arg(long, env = "SENTINEL_SNAPSHOT_DIR", default_value = "alerts/snapshots")]
    snapshot_dir: String,
    /// Only show alerts from this camera.
    #[arg(long)]
    camera: Option<u32>,
    /// Maximum number of alerts to show.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct AlertRow<'a> {
    id: i64,
    camera_id: u32,
    rule: &'a str,
    track_id: u64,
    timestamp_ms: u64,
    snapshot: Option<String>,
    snapshot_sha256: Option<&'a str>,
    message: &'a str,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut store = SqliteAlertStore::open(&args.db_path, &args.snapshot_dir)?;
    let alerts = store.get_recent_alerts(args.camera, args.limit)?;

    let rows: Vec<AlertRow> = alerts.iter().map(|a| row(&store, a)).collect();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        eprintln!("no alerts");
        return Ok(());
    }
    println!(
        "{:>6}  {:>4}  {:<12}  {:>6}  {:>14}  {}",
        "id", "cam", "rule", "track", "timestamp_ms", "snapshot"
    );
    for r in &rows {
        println!(
            "{:>6}  {:>4}  {:<12}  {:>6}  {:>14}  {}",
            r.id,
            r.camera_id,
            r.rule,
            r.track_id,
            r.timestamp_ms,
            r.snapshot.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn row<'a>(store: &SqliteAlertStore, alert: &'a StoredAlert) -> AlertRow<'a> {
    AlertRow {
        id: alert.id,
        camera_id: alert.event.camera_id,
        rule: alert.event.rule.as_str(),
        track_id: alert.event.track_id,
        timestamp_ms: alert.event.timestamp_ms,
        snapshot: alert
            .event
            .snapshot_ref
            .as_deref()
            .map(|name| store.snapshot_path(name).display().to_string()),
        snapshot_sha256: alert.snapshot_sha256.as_deref(),
        message: &alert.event.detail.message,
    }
}
