//! demo - synthetic end-to-end run
//!
//! Drives stub cameras through the full pipeline (stub scene, stub
//! detector, rules, debouncing, SQLite alert store) and prints the alerts
//! that were persisted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use hazard_sentinel::preview::PreviewRenderer;
use hazard_sentinel::{
    ingest, AlertSink, AlertStore, BackendRegistry, CameraWorker, ClassMap, FrameAggregator,
    RuleKind, RuleSet, RuleThresholds, ShutdownSignal, SqliteAlertStore, WorkerSettings,
    WorkerState, Zone,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory for the demo database, snapshots and previews.
    #[arg(long, default_value = "demo_out")]
    out_dir: PathBuf,
    /// Number of synthetic cameras.
    #[arg(long, default_value_t = 2)]
    cameras: u32,
    /// Frames per camera before its stream ends.
    #[arg(long, default_value_t = 240)]
    frames: u64,
    /// Synthetic stream frame rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 240)]
    height: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.out_dir)?;
    let db_path = args.out_dir.join("alerts.db").display().to_string();
    let snapshot_dir = args.out_dir.join("snapshots");
    let store = SqliteAlertStore::open(&db_path, snapshot_dir.clone())?;
    let (alerts, sink) = AlertSink::spawn(store, 64, Duration::from_millis(100))?;

    let registry = BackendRegistry::with_builtin(ClassMap::default());
    let shutdown = ShutdownSignal::new();
    let mut aggregator = FrameAggregator::new(2)?;
    let (w, h) = (args.width as f32, args.height as f32);

    let mut workers = Vec::new();
    for camera_id in 0..args.cameras {
        // Vertical strip through the middle of the frame.
        let zone = Zone::new(
            camera_id,
            "center_strip",
            &[[w * 0.4, 0.0], [w * 0.6, 0.0], [w * 0.6, h], [w * 0.4, h]],
        )?;
        let rules = RuleSet::new(RuleKind::ALL.to_vec(), vec![zone], RuleThresholds::default());
        let mut settings = WorkerSettings::new(camera_id, rules);
        settings.cooldown = Duration::from_secs(1);
        settings.grace = Duration::from_secs(1);
        settings.backoff.max_retries = Some(0);

        let locator = format!("stub://demo{}?frames={}", camera_id, args.frames);
        let source = ingest::open_source(camera_id, &locator, args.fps, args.width, args.height)?;
        let detector = registry.create("stub", camera_id)?;
        let worker = CameraWorker::new(
            settings,
            source,
            detector,
            alerts.clone(),
            aggregator.publisher(camera_id),
        );
        workers.push(worker.spawn(shutdown.clone())?);
    }
    drop(alerts);

    let mut renderer = PreviewRenderer::new(args.out_dir.join("preview"), args.width, args.height);
    loop {
        if let Some(frame) = aggregator.recv_timeout(Duration::from_millis(100)) {
            renderer.ingest(frame);
        }
        if aggregator
            .states()
            .values()
            .all(|state| *state == WorkerState::Stopped)
        {
            break;
        }
    }
    for frame in aggregator.drain() {
        renderer.ingest(frame);
    }
    renderer.render(&aggregator.states())?;

    for handle in workers {
        if let Ok(stats) = handle.join() {
            log::info!(
                "worker done: {} frames, {} alerts",
                stats.frames_processed,
                stats.alerts_emitted
            );
        }
    }
    let (mut store, stats) = sink.shutdown(Duration::from_secs(5))?;

    println!("{} alerts persisted to {}", stats.persisted, db_path);
    for alert in store.get_recent_alerts(None, 50)? {
        println!(
            "  cam{} {:<12} track {:>3}  {}  {}",
            alert.event.camera_id,
            alert.event.rule.as_str(),
            alert.event.track_id,
            alert.event.detail.message,
            alert
                .event
                .snapshot_ref
                .as_deref()
                .map(|name| store.snapshot_path(name).display().to_string())
                .unwrap_or_default()
        );
    }
    println!("previews in {}", renderer.dir().display());
    Ok(())
}
