//! sentineld - multi-camera safety monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration and danger zones (any error here is fatal)
//! 2. Opens the alert store and starts the alert sink thread
//! 3. Starts one worker thread per camera (ingest, detect, rules, alerts)
//! 4. Renders the newest annotated frame per camera into preview JPEGs
//! 5. On Ctrl-C, stops the workers and drains the alert queue

use anyhow::Result;

use hazard_sentinel::preview::{self, PreviewRenderer};
use hazard_sentinel::sink::RetentionPolicy;
use hazard_sentinel::{
    ingest, AlertSink, BackendRegistry, CameraWorker, FrameAggregator, SentinelConfig,
    ShutdownSignal, SqliteAlertStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = SentinelConfig::load()?;
    let zones = cfg.load_zones()?;
    log::info!(
        "sentineld {}: {} cameras, {} zones, detector {}",
        env!("CARGO_PKG_VERSION"),
        cfg.cameras.len(),
        zones.len(),
        cfg.detector
    );

    let registry = BackendRegistry::with_builtin(cfg.classes.clone());
    let store = SqliteAlertStore::open(&cfg.db_path, cfg.snapshot_dir.clone())?;
    let retention = RetentionPolicy {
        max_age: cfg.retention,
        interval: cfg.prune_interval,
    };
    let (alerts, sink) = AlertSink::spawn_with_retention(
        store,
        cfg.pipeline.alert_queue_capacity,
        cfg.pipeline.alert_enqueue_timeout,
        Some(retention),
    )?;
    log::info!("alerts stored in {} (snapshots in {})", cfg.db_path, cfg.snapshot_dir.display());

    let shutdown = ShutdownSignal::new();
    let mut aggregator = FrameAggregator::new(cfg.pipeline.frame_buffer)?;
    let mut workers = Vec::with_capacity(cfg.cameras.len());
    for camera in &cfg.cameras {
        let locator = cfg.source_for(camera);
        let source = ingest::open_source(
            camera.id,
            &locator,
            cfg.frame.target_fps,
            cfg.frame.width,
            cfg.frame.height,
        )?;
        let detector = registry.create(cfg.detector_for(camera), camera.id)?;
        let worker = CameraWorker::new(
            cfg.worker_settings(camera, &zones),
            source,
            detector,
            alerts.clone(),
            aggregator.publisher(camera.id),
        );
        log::info!("camera {}: source {}", camera.id, locator);
        workers.push((camera.id, worker.spawn(shutdown.clone())?));
    }
    // Workers hold the only remaining senders.
    drop(alerts);

    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        signal.trigger();
    })
    .expect("error setting Ctrl-C handler");

    let mut renderer =
        PreviewRenderer::new(cfg.preview_dir.clone(), cfg.frame.width, cfg.frame.height);
    log::info!("writing previews to {} (Ctrl-C to stop)", cfg.preview_dir.display());
    preview::run(
        &aggregator,
        &mut renderer,
        &shutdown,
        cfg.pipeline.preview_interval,
        cfg.pipeline.health_interval,
    );

    for (camera_id, handle) in workers {
        match handle.join() {
            Ok(stats) => log::info!(
                "camera {}: stopped after {} frames, {} alerts ({} dropped), {} detector failures, {} reconnects",
                camera_id,
                stats.frames_processed,
                stats.alerts_emitted,
                stats.alerts_dropped,
                stats.detector_failures,
                stats.reconnects
            ),
            Err(_) => log::error!("camera {}: worker thread panicked", camera_id),
        }
    }

    let (_, stats) = sink.shutdown(cfg.pipeline.drain_timeout)?;
    if stats.discarded > 0 {
        log::warn!("{} alerts discarded at drain deadline", stats.discarded);
    }
    log::info!(
        "sentineld stopped ({} alerts persisted, {} frames displayed)",
        stats.persisted,
        renderer.received()
    );
    Ok(())
}
