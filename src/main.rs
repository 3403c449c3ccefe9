//! eldcore - device-resident ELD compliance engine
//!
//! Runs the duty-status state machine, HOS calculator, durable event log,
//! and priority sync worker for one driver device.
//!
//! # Usage
//!
//! ```bash
//! # Run with telemetry piped in as JSON lines
//! canbus_bridge | eldcore --stdin
//!
//! # Replay a recorded telemetry script at 60x
//! eldcore --replay trip.jsonl --speed 60
//! ```
//!
//! # Environment Variables
//!
//! - `ELDCORE_CONFIG`: Path to the device TOML config
//! - `RUST_LOG`: Logging level (default: info)
//! - `RESET_DB`: Set to "true" to wipe all persistent data on startup

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eldcore::config::{self, DeviceConfig};
use eldcore::connectivity::{BandwidthClass, ConnectivityMonitor, LinkState};
use eldcore::duty::{spawn_session, DriverSession};
use eldcore::hos::HosProfile;
use eldcore::notify::TracingSink;
use eldcore::storage::{EventLog, ProcessLock};
use eldcore::sync::{BatchBudgets, HttpTransport, SyncQueue, SyncWorker, SyncWorkerConfig};
use eldcore::telemetry::{ReplaySource, SampleEvent, StdinSource, TelemetrySample, TelemetrySource};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "eldcore")]
#[command(about = "ELD compliance engine: HOS enforcement and offline-first sync")]
#[command(version)]
struct CliArgs {
    /// Path to the device TOML config (overrides ELDCORE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory from config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Read telemetry samples from stdin (JSON lines)
    #[arg(long)]
    stdin: bool,

    /// Replay a recorded telemetry script (JSON lines file)
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Replay speed multiplier (1 = realtime pacing, 0 = no delay)
    #[arg(long, default_value = "1")]
    speed: u64,

    /// Emit logs as JSON (for device log shippers)
    #[arg(long)]
    json_logs: bool,

    /// Wipe all persistent data on startup. Destructive!
    /// Can also be set via RESET_DB=true.
    #[arg(long)]
    reset_db: bool,
}

/// Telemetry source that never yields — commands-only mode.
struct IdleSource;

#[async_trait::async_trait]
impl TelemetrySource for IdleSource {
    async fn next_sample(&mut self) -> Result<SampleEvent> {
        Ok(futures::future::pending().await)
    }

    fn source_name(&self) -> &str {
        "idle"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);

    // Config: --config flag > ELDCORE_CONFIG > ./device_config.toml > defaults
    let device_config = match &args.config {
        Some(path) => DeviceConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => DeviceConfig::load(),
    };
    device_config.validate().context("invalid device config")?;
    config::init(device_config);
    let cfg = config::get();

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| cfg.device.data_dir.clone());

    // One engine instance per data directory
    let _lock = ProcessLock::acquire(&data_dir)?;

    let reset = args.reset_db
        || std::env::var("RESET_DB").map(|v| v == "true").unwrap_or(false);
    if reset {
        warn!("RESET_DB requested — wiping persistent data");
        for sub in ["event_log", "sync_queue", "archive"] {
            let path = data_dir.join(sub);
            if path.exists() {
                std::fs::remove_dir_all(&path)
                    .with_context(|| format!("failed to remove {:?}", path))?;
            }
        }
    }

    info!(
        device = %cfg.device.device_id,
        driver = %cfg.device.driver_id,
        data_dir = %data_dir.display(),
        "eldcore starting"
    );

    let log = EventLog::open(&data_dir)?;
    let queue = SyncQueue::open(&data_dir)?;
    let sink = Arc::new(TracingSink);
    let sync_wake = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    // Connectivity: the platform layer drives this monitor; the standalone
    // daemon assumes a link whenever a hub is configured
    let monitor = ConnectivityMonitor::new();
    if !cfg.sync.hub_url.is_empty() {
        monitor.report(LinkState::Online(BandwidthClass::Medium));
    }

    // Sync worker (only with a configured hub)
    let mut sync_task = None;
    if cfg.sync.hub_url.is_empty() {
        info!("No hub configured — running fully offline, queue accumulates");
    } else {
        let transport = HttpTransport::new(
            &cfg.sync.hub_url,
            &cfg.sync.api_key,
            &cfg.device.device_id,
            std::time::Duration::from_secs(cfg.sync.request_timeout_secs),
        )?;
        let worker = SyncWorker::new(
            queue.clone(),
            log.clone(),
            Arc::new(transport),
            sink.clone(),
            monitor.subscribe(),
            sync_wake.clone(),
            cancel.clone(),
            SyncWorkerConfig {
                device_id: cfg.device.device_id.clone(),
                driver_id: cfg.device.driver_id.clone(),
                budgets: BatchBudgets {
                    normal_bytes: cfg.sync.batch_byte_budget,
                    critical_bytes: cfg.sync.critical_batch_byte_budget,
                },
                request_timeout: std::time::Duration::from_secs(cfg.sync.request_timeout_secs),
                delayed_warning_ceiling: cfg.sync.delayed_warning_ceiling,
            },
        );
        sync_task = Some(tokio::spawn(worker.run()));
    }

    // Retention/compaction sweep
    let compaction_task = tokio::spawn(run_compaction(
        log.clone(),
        queue.clone(),
        cancel.clone(),
        cfg.storage.retention_days,
        cfg.storage.compaction_interval_secs,
    ));

    // Driver session
    let profile = HosProfile::from_config(&cfg.hos)?;
    let session = DriverSession::open(
        cfg,
        profile,
        log.clone(),
        queue.clone(),
        sink,
        sync_wake,
    )?;

    let (_handle, session_task) = if let Some(path) = &args.replay {
        let samples = load_replay(path)?;
        info!(samples = samples.len(), file = %path.display(), "Replaying telemetry script");
        let delay_ms = if args.speed == 0 { 0 } else { 1000 / args.speed.max(1) };
        spawn_session(session, ReplaySource::new(samples, delay_ms), cancel.clone())
    } else if args.stdin {
        spawn_session(session, StdinSource::new(), cancel.clone())
    } else {
        info!("No telemetry source — commands-only mode");
        spawn_session(session, IdleSource, cancel.clone())
    };

    // Run until interrupted
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    info!("Shutdown requested");
    cancel.cancel();

    let session = session_task.await.context("session task panicked")?;
    if let Some(task) = sync_task {
        let _ = task.await;
    }
    let _ = compaction_task.await;

    let stats = log.stats();
    info!(
        driver = %session.driver_id(),
        events = stats.event_count,
        quarantined = stats.quarantined_count,
        size_bytes = stats.size_bytes,
        "eldcore stopped"
    );
    Ok(())
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Load a telemetry script: JSON lines of [`TelemetrySample`].
fn load_replay(path: &PathBuf) -> Result<Vec<TelemetrySample>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read replay file {:?}", path))?;
    let mut samples = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let sample: TelemetrySample = serde_json::from_str(line)
            .with_context(|| format!("malformed sample on line {}", idx + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}

/// Periodic archival sweep honoring the retention floor and queue pins.
async fn run_compaction(
    log: EventLog,
    queue: SyncQueue,
    cancel: CancellationToken,
    retention_days: u32,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    // First tick fires immediately; skip it so startup stays fast
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let pinned = match queue.pinned_refs() {
            Ok(pinned) => pinned,
            Err(e) => {
                warn!(error = %e, "Compaction skipped: could not read queue pins");
                continue;
            }
        };
        match log.compact(cutoff, &pinned) {
            Ok(stats) if stats.archived > 0 => {
                info!(
                    archived = stats.archived,
                    pinned_skipped = stats.pinned_skipped,
                    "Compaction sweep archived old events"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Compaction sweep failed"),
        }
    }
}
