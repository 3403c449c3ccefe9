//! Synthetic trip simulator — drives the whole engine without a vehicle.
//!
//! Generates a scripted duty day (pre-trip inspection, highway driving with
//! speed noise, a dock stop with a yard move, deliveries), feeds it through
//! a real session at an accelerated clock, and acknowledges sync batches
//! with an in-memory hub. Useful for demos and for eyeballing advisory
//! behavior near the HOS limits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use clap::Parser;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use eldcore::config::DeviceConfig;
use eldcore::connectivity::{BandwidthClass, ConnectivityMonitor, LinkState};
use eldcore::duty::{spawn_session, DriverSession};
use eldcore::hos::HosProfile;
use eldcore::notify::ChannelSink;
use eldcore::storage::EventLog;
use eldcore::sync::{
    BatchAck, BatchBudgets, ConflictNotice, SyncBatch, SyncQueue, SyncTransport, SyncWorker,
    SyncWorkerConfig, TransportError,
};
use eldcore::telemetry::{ReplaySource, TelemetrySample};
use eldcore::types::{DeliveryEvent, DomainEvent, InspectionEvent};

#[derive(Parser, Debug)]
#[command(name = "simulate")]
#[command(about = "Run a synthetic duty day through the ELD engine")]
struct CliArgs {
    /// Hours of highway driving to script
    #[arg(long, default_value = "9")]
    drive_hours: u64,

    /// Drop the link for the middle third of the day (offline accumulation)
    #[arg(long)]
    offline_window: bool,
}

/// In-memory hub: acknowledges everything, records batches in arrival order.
struct LoopbackHub {
    batches: Mutex<Vec<SyncBatch>>,
}

#[async_trait]
impl SyncTransport for LoopbackHub {
    async fn send_batch(&self, batch: &SyncBatch) -> Result<BatchAck, TransportError> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(BatchAck {
            batch_id: batch.batch_id,
            checksum: batch.checksum.clone(),
            accepted: batch.items.iter().map(|i| i.item_id).collect(),
            rejected: Vec::new(),
            conflicts: Vec::new(),
        })
    }

    async fn poll_conflicts(&self, _driver_id: &str) -> Result<Vec<ConflictNotice>, TransportError> {
        Ok(Vec::new())
    }
}

/// Script one duty day of telemetry with realistic speed noise.
fn script_day(start: DateTime<Utc>, drive_hours: u64) -> Vec<TelemetrySample> {
    let mut rng = rand::thread_rng();
    let mut samples = Vec::new();
    let mut t = start;

    let push = |t: DateTime<Utc>, speed: f64, rng: &mut rand::rngs::ThreadRng| {
        let noise: f64 = rng.gen_range(-1.5..1.5);
        TelemetrySample {
            timestamp: t,
            speed_mph: (speed + noise).max(0.0),
            engine_on: true,
            gps: None,
            confidence: rng.gen_range(0.85..1.0),
        }
    };

    // 10 minutes parked at the terminal (pre-trip)
    for _ in 0..600 {
        samples.push(push(t, 0.0, &mut rng));
        t += Duration::seconds(1);
    }
    // Highway stint
    for _ in 0..(drive_hours * 3600) {
        samples.push(push(t, 58.0, &mut rng));
        t += Duration::seconds(1);
    }
    // Dock approach: two minutes of yard creep
    for _ in 0..120 {
        samples.push(push(t, 3.0, &mut rng));
        t += Duration::seconds(1);
    }
    // Parked at the dock
    for _ in 0..600 {
        samples.push(push(t, 0.0, &mut rng));
        t += Duration::seconds(1);
    }
    samples
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let data_dir = std::env::temp_dir().join(format!("eldcore-sim-{}", std::process::id()));
    std::fs::create_dir_all(&data_dir)?;
    let config = DeviceConfig::default();
    config.validate()?;

    let start = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap();
    let samples = script_day(start, args.drive_hours);
    info!(samples = samples.len(), "Scripted duty day generated");

    let log = EventLog::open(&data_dir)?;
    let queue = SyncQueue::open(&data_dir)?;
    let (sink, mut advisories) = ChannelSink::new();
    let sync_wake = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let monitor = ConnectivityMonitor::new();
    monitor.report(LinkState::Online(BandwidthClass::High));

    let hub = Arc::new(LoopbackHub {
        batches: Mutex::new(Vec::new()),
    });
    let worker = SyncWorker::new(
        queue.clone(),
        log.clone(),
        hub.clone(),
        sink.clone(),
        monitor.subscribe(),
        sync_wake.clone(),
        cancel.clone(),
        SyncWorkerConfig {
            device_id: config.device.device_id.clone(),
            driver_id: config.device.driver_id.clone(),
            budgets: BatchBudgets {
                normal_bytes: config.sync.batch_byte_budget,
                critical_bytes: config.sync.critical_batch_byte_budget,
            },
            request_timeout: std::time::Duration::from_secs(5),
            delayed_warning_ceiling: config.sync.delayed_warning_ceiling,
        },
    );
    let sync_task = tokio::spawn(worker.run());

    let session = DriverSession::open(
        &config,
        HosProfile::from_config(&config.hos)?,
        log.clone(),
        queue.clone(),
        sink,
        sync_wake,
    )?;

    let driver_id = config.device.driver_id.clone();
    let vehicle_id = config.device.vehicle_id.clone();

    // No pacing delay: the replay clock lives in the sample timestamps
    let (handle, session_task) =
        spawn_session(session, ReplaySource::new(samples, 0), cancel.clone());

    handle.clock_in(start).await;

    // Pre-trip inspection before rolling
    handle
        .record_event(DomainEvent::Inspection(InspectionEvent {
            event_id: Uuid::new_v4(),
            driver_id: driver_id.clone(),
            vehicle_id: vehicle_id.clone(),
            occurred_at: start + Duration::minutes(5),
            passed: true,
            defects: Vec::new(),
            notes: Some("pre-trip".to_string()),
        }))
        .await?;

    if args.offline_window {
        monitor.report(LinkState::Offline);
        info!("Link dropped for offline accumulation window");
    }

    // Let the replay run; drain advisories as they arrive
    let mut advisory_count = 0usize;
    let drain = async {
        while let Some(advisory) = advisories.recv().await {
            advisory_count += 1;
            info!(
                severity = ?advisory.severity,
                "ADVISORY: {}",
                advisory.message
            );
        }
    };
    let wait = tokio::time::sleep(std::time::Duration::from_secs(5));
    tokio::select! {
        _ = drain => {}
        _ = wait => {}
    }

    if args.offline_window {
        monitor.report(LinkState::Online(BandwidthClass::High));
        info!("Link restored — watch the drain order");
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }

    // Delivery confirmation at the dock, then close out
    let dock_time = start + Duration::hours(args.drive_hours as i64) + Duration::minutes(25);
    handle
        .record_event(DomainEvent::Delivery(DeliveryEvent {
            event_id: Uuid::new_v4(),
            driver_id: driver_id.clone(),
            vehicle_id: vehicle_id.clone(),
            occurred_at: dock_time,
            route_id: "RT-100".to_string(),
            stop_id: "STOP-7".to_string(),
            route_version: 1,
            signature_ref: None,
        }))
        .await?;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    if let Some(window) = handle.snapshot().await {
        info!(
            drive_secs = window.drive_secs_today,
            duty_secs = window.on_duty_secs_today,
            since_break = window.drive_secs_since_break,
            "Final HOS window"
        );
    }
    let _ = handle.clock_out(dock_time + Duration::minutes(10)).await;

    cancel.cancel();
    let _ = session_task.await;
    let _ = sync_task.await;

    let stats = log.stats();
    let batches = hub.batches.lock().unwrap();
    info!(
        events = stats.event_count,
        batches = batches.len(),
        advisories = advisory_count,
        "Simulation complete"
    );
    for (idx, batch) in batches.iter().enumerate() {
        info!(
            "  batch {}: {} x{} ({})",
            idx,
            batch.priority,
            batch.items.len(),
            &batch.checksum[..8]
        );
    }
    drop(batches);

    let _ = std::fs::remove_dir_all(&data_dir);
    Ok(())
}
