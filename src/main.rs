//! CloudPark - camera-driven parking occupancy and navigation service
//!
//! Watches parking spots through cameras, keeps the live status of every spot,
//! streams changes to subscribers, and routes drivers to free spots.
//!
//! Module structure:
//! - `domain/` - Core types (spots, zones, grid, events)
//! - `io/` - External interfaces (cameras, detector, API, MQTT, persistence)
//! - `services/` - Business logic (monitor, store, bus, navigation, assignment)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use cloudpark::domain::Layout;
use cloudpark::infra::{Config, Metrics};
use cloudpark::io::{
    api, prometheus, AppState, Detector, HttpDetector, HttpSnapshotConnector, MqttPublisher,
    ParkingLog, SnapshotFile,
};
use cloudpark::services::{
    CameraMonitor, EventBus, MonitorContext, MonitorTimings, PersistenceWorker, StatusStore,
};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// CloudPark - parking occupancy tracking and navigation
#[derive(Parser, Debug)]
#[command(name = "cloudpark", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "cloudpark starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        layout = %config.layout_file(),
        api_port = %config.api_port(),
        target_fps = %config.target_fps(),
        detector_url = %config.detector_url(),
        read_plates = %config.read_plates(),
        mqtt_egress = %config.mqtt_egress_enabled(),
        reserve_on_assign = %config.reserve_on_assign(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let mut layout = Layout::from_file(config.layout_file())?;
    for (zone_id, err) in layout.invalid_grids() {
        // Routing into this zone will fail; everything else keeps working
        warn!(zone_id = %zone_id, error = %err, "zone_grid_invalid");
    }

    let snapshot = SnapshotFile::open(config.snapshot_file())?;
    let applied = layout.apply_persisted(&snapshot.statuses());
    info!(
        organizations = layout.organizations().len(),
        spots = layout.spots().len(),
        cameras = layout.cameras().len(),
        persisted_applied = applied,
        "layout_loaded"
    );
    let layout = Arc::new(layout);

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(StatusStore::new());
    let bus = EventBus::new(config.subscriber_buffer(), metrics.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Subscribe before any camera can publish
    let persistence = PersistenceWorker::new(
        snapshot,
        ParkingLog::new(config.parking_log_file()),
        bus.clone(),
        store.clone(),
    );

    // Blocking HTTP clients must be built outside the async runtime
    let detector: Arc<dyn Detector> = Arc::new(
        HttpDetector::new(
            config.detector_url(),
            config.detector_timeout(),
            config.confidence_threshold(),
        )
        .context("Failed to build detector client")?,
    );
    let camera_threads = start_cameras(
        &config,
        &layout,
        MonitorContext { store: store.clone(), bus: bus.clone(), metrics: metrics.clone(), detector },
        &shutdown_rx,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let state = AppState {
        layout,
        store,
        bus,
        metrics,
        reserve_on_assign: config.reserve_on_assign(),
    };
    runtime.block_on(run_services(config, state, persistence, shutdown_tx, shutdown_rx))?;

    for handle in camera_threads {
        if handle.join().is_err() {
            error!("camera_thread_panicked");
        }
    }

    info!("cloudpark shutdown complete");
    Ok(())
}

/// Spawn one monitor thread per camera that watches at least one spot
fn start_cameras(
    config: &Config,
    layout: &Layout,
    ctx: MonitorContext,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let timings = MonitorTimings::from_config(config);
    let mut handles = Vec::with_capacity(layout.cameras().len());

    for camera in layout.cameras() {
        let spots = layout.camera_spots(camera);
        if spots.is_empty() {
            warn!(camera_id = %camera.id, camera = %camera.name, "camera_without_spots_skipped");
            continue;
        }

        let connector = HttpSnapshotConnector::new(config.source_timeout())
            .context("Failed to build camera client")?;
        let monitor = CameraMonitor::new(
            camera,
            spots,
            Box::new(connector),
            ctx.clone(),
            timings,
            config.read_plates(),
        );
        match monitor.spawn(shutdown.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(camera_id = %camera.id, error = %e, "camera_thread_spawn_failed"),
        }
    }

    info!(cameras = handles.len(), "cameras_started");
    Ok(handles)
}

async fn run_services(
    config: Config,
    state: AppState,
    persistence: PersistenceWorker,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let persistence_task = tokio::spawn(persistence.run(shutdown_rx.clone()));

    // Start MQTT egress publisher (if enabled)
    if config.mqtt_egress_enabled() {
        let publisher = MqttPublisher::new(&config, state.bus.clone());
        tokio::spawn(publisher.run(shutdown_rx.clone()));
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = state.metrics.clone();
        let prom_store = state.store.clone();
        let site_id = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_store,
                site_id,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary log
    let reporter_metrics = state.metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let addr = format!("{}:{}", config.api_bind_address(), config.api_port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {addr}"))?;
    api::serve(listener, state, shutdown_rx).await.context("API server failed")?;

    // Let persistence flush what is already queued
    if let Err(e) = persistence_task.await {
        error!(error = %e, "persistence_task_failed");
    }
    Ok(())
}
