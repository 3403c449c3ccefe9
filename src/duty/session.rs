//! Driver session — the single writer for one driver's compliance state.
//!
//! All state-machine transitions and event-log appends for a driver flow
//! through one `DriverSession`, owned by one task. Telemetry-driven
//! auto-switches and manual commands arriving near-simultaneously cannot
//! race: commands carry the state token the caller observed, and a stale
//! token is rejected with `ConcurrentTransitionError` instead of silently
//! overwritten. Sessions for different drivers are fully independent.

use super::state_machine::{DutyStateMachine, StateToken, TransitionError, TransitionRequest};
use crate::config::{DeviceConfig, TelemetryConfig};
use crate::hos::{HosCalculator, HosProfile, HosSignal, HosWindow, LimitKind};
use crate::notify::{Advisory, AdvisoryKind, AdvisorySeverity, NotificationSink};
use crate::storage::{EventLog, StorageError};
use crate::sync::{QueueError, SyncQueue};
use crate::telemetry::{
    MotionDebouncer, MotionEdge, SampleEvent, TelemetrySample, TelemetrySource,
};
use crate::types::{
    DomainEvent, DutyStatus, DutyStatusEvent, GpsFix, ShiftSession, TransitionCause,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from non-transition record operations (inspections, deliveries…).
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("driver session is closed")]
    SessionClosed,
}

/// Movement slower than this is parking creep, not a yard move.
const YARD_MOVE_MIN_SPEED_MPH: f64 = 1.0;

// ============================================================================
// Session
// ============================================================================

/// Single-writer compliance session for one driver.
pub struct DriverSession {
    driver_id: String,
    vehicle_id: String,
    machine: DutyStateMachine,
    calculator: HosCalculator,
    debouncer: MotionDebouncer,
    telemetry_cfg: TelemetryConfig,
    log: EventLog,
    queue: SyncQueue,
    sink: Arc<dyn NotificationSink>,
    /// Wakes the sync worker on each committed event
    sync_wake: Arc<Notify>,
    shift: Option<ShiftSession>,
    last_gps: Option<GpsFix>,
    yard_run_started: Option<DateTime<Utc>>,
    yard_flagged: bool,
}

impl DriverSession {
    /// Create a session, rebuilding all derived state from the committed
    /// log (crash recovery is exactly this path: derived state is
    /// discarded and recomputed, never trusted across restarts).
    pub fn open(
        config: &DeviceConfig,
        profile: HosProfile,
        log: EventLog,
        queue: SyncQueue,
        sink: Arc<dyn NotificationSink>,
        sync_wake: Arc<Notify>,
    ) -> Result<Self, StorageError> {
        let driver_id = config.device.driver_id.clone();
        let vehicle_id = config.device.vehicle_id.clone();
        let mut machine = DutyStateMachine::new(&driver_id, &vehicle_id);
        let mut calculator =
            HosCalculator::new(profile, config.device.home_terminal_offset_minutes);

        let mut duty_events = 0u64;
        let mut last_status = DutyStatus::OffDuty;
        for event in log.scan_driver(&driver_id)? {
            if let DomainEvent::DutyStatus(duty) = event {
                let _ = calculator.observe(&duty);
                last_status = duty.status;
                duty_events += 1;
            }
        }
        machine.restore(last_status, duty_events);
        if calculator.drive_exhausted() {
            machine.lock_driving();
        }
        if duty_events > 0 {
            info!(
                driver = %driver_id,
                replayed = duty_events,
                status = %last_status,
                "Session state rebuilt from event log"
            );
        }

        Ok(Self {
            driver_id,
            vehicle_id,
            machine,
            calculator,
            debouncer: MotionDebouncer::new(
                config.telemetry.driving_speed_threshold_mph,
                config.telemetry.debounce_secs,
                config.telemetry.min_confidence,
            ),
            telemetry_cfg: config.telemetry.clone(),
            log,
            queue,
            sink,
            sync_wake,
            shift: None,
            last_gps: None,
            yard_run_started: None,
            yard_flagged: false,
        })
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn current_status(&self) -> DutyStatus {
        self.machine.current()
    }

    pub fn state_token(&self) -> StateToken {
        self.machine.token()
    }

    pub fn hos_window(&self) -> HosWindow {
        self.calculator.snapshot()
    }

    // ------------------------------------------------------------------------
    // Manual command interface (driver UI and dispatcher share this path)
    // ------------------------------------------------------------------------

    /// Request a duty-status transition.
    ///
    /// `token` is the state the caller observed; `None` skips the
    /// concurrency check (telemetry-internal callers only). On success
    /// returns the new token.
    pub fn request_transition(
        &mut self,
        target: DutyStatus,
        cause: TransitionCause,
        reason: Option<String>,
        gps: Option<GpsFix>,
        token: Option<StateToken>,
        at: DateTime<Utc>,
    ) -> Result<StateToken, TransitionError> {
        if let Some(observed) = token {
            let current = self.machine.token();
            if observed != current {
                return Err(TransitionError::ConcurrentTransition {
                    observed: observed.0,
                    current: current.0,
                });
            }
        }

        let signals = self.calculator.check(at);
        self.handle_signals(&signals, at);

        let request = TransitionRequest {
            target,
            cause,
            occurred_at: at,
            reason,
            gps: gps.or(self.last_gps),
            source_confidence: 1.0,
            corrects: None,
        };

        let drive_allowed = !self.calculator.drive_exhausted();
        match self.machine.validate(&request, drive_allowed) {
            Ok(()) => {}
            Err(TransitionError::LimitExceeded) => {
                // The rejection itself forces the stop and locks driving
                self.force_off_duty(at, self.binding_limit());
                return Err(TransitionError::LimitExceeded);
            }
            Err(e) => return Err(e),
        }

        let event = self.machine.build(&request);
        let signals = self
            .persist_and_fanout(event)
            .map_err(|e| TransitionError::Storage(e.to_string()))?;
        // Stale motion history must not contradict the commanded status
        self.debouncer.reset();
        self.handle_signals(&signals, at);
        Ok(self.machine.token())
    }

    /// Record a non-transition field event (inspection, incident, delivery,
    /// fuel, telemetry rollup) into the log and sync queue.
    pub fn record_event(&mut self, event: DomainEvent) -> Result<(), RecordError> {
        if event.driver_id() != self.driver_id {
            return Err(RecordError::Validation(format!(
                "event driver {} does not match session driver {}",
                event.driver_id(),
                self.driver_id
            )));
        }
        if matches!(event, DomainEvent::DutyStatus(_)) {
            return Err(RecordError::Validation(
                "duty-status events go through request_transition".to_string(),
            ));
        }

        let key = self.log.append(&event)?;
        self.queue.enqueue_event(&event, key)?;
        self.sync_wake.notify_one();
        if let Some(shift) = &mut self.shift {
            shift.events_recorded += 1;
        }
        debug!(
            driver = %self.driver_id,
            kind = event.kind_name(),
            "Field event recorded"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Telemetry ingestion
    // ------------------------------------------------------------------------

    /// Ingest one telemetry sample: advance the clock, check limits, and
    /// run the auto-switch and yard-move detectors.
    pub fn ingest_sample(&mut self, sample: TelemetrySample) {
        if sample.gps.is_some() {
            self.last_gps = sample.gps;
        }

        let signals = self.calculator.check(sample.timestamp);
        self.handle_signals(&signals, sample.timestamp);

        if let Some(edge) = self.debouncer.update(&sample) {
            match edge {
                MotionEdge::DrivingDetected => {
                    if self.machine.current() != DutyStatus::Driving {
                        self.auto_transition(DutyStatus::Driving, &sample);
                    }
                }
                MotionEdge::StoppedDetected => {
                    if self.machine.current() == DutyStatus::Driving {
                        self.auto_transition(DutyStatus::OnDutyNotDriving, &sample);
                    }
                }
            }
        }

        self.track_yard_move(&sample);
    }

    fn auto_transition(&mut self, target: DutyStatus, sample: &TelemetrySample) {
        let request = TransitionRequest {
            target,
            cause: TransitionCause::AutoSwitch,
            occurred_at: sample.timestamp,
            reason: None,
            gps: sample.gps,
            source_confidence: sample.confidence,
            corrects: None,
        };
        let drive_allowed = !self.calculator.drive_exhausted();
        match self.machine.validate(&request, drive_allowed) {
            Ok(()) => {
                let event = self.machine.build(&request);
                match self.persist_and_fanout(event) {
                    Ok(signals) => {
                        info!(
                            driver = %self.driver_id,
                            status = %target,
                            "Auto-switch applied"
                        );
                        self.handle_signals(&signals, sample.timestamp);
                    }
                    Err(e) => warn!(error = %e, "Auto-switch event could not be persisted"),
                }
            }
            Err(TransitionError::LimitExceeded) => {
                // No drive time left: motion forces a stop, not a switch
                self.force_off_duty(sample.timestamp, self.binding_limit());
            }
            Err(e) => debug!(error = %e, "Auto-switch suppressed"),
        }
    }

    /// Yard moves: sustained sub-threshold movement while on duty is
    /// annotated, never promoted to `Driving`.
    fn track_yard_move(&mut self, sample: &TelemetrySample) {
        if self.machine.current() != DutyStatus::OnDutyNotDriving
            || !sample.engine_on
            || sample.confidence < self.telemetry_cfg.min_confidence
        {
            self.yard_run_started = None;
            self.yard_flagged = false;
            return;
        }

        let creeping = sample.speed_mph > YARD_MOVE_MIN_SPEED_MPH
            && sample.speed_mph <= self.telemetry_cfg.driving_speed_threshold_mph;
        if !creeping {
            self.yard_run_started = None;
            self.yard_flagged = false;
            return;
        }

        let started = *self.yard_run_started.get_or_insert(sample.timestamp);
        let held = (sample.timestamp - started).num_seconds();
        if held >= self.telemetry_cfg.debounce_secs as i64 && !self.yard_flagged {
            self.yard_flagged = true;
            let event =
                self.machine
                    .build_yard_move(sample.timestamp, sample.gps, sample.confidence);
            match self.persist_and_fanout(event) {
                Ok(_) => info!(driver = %self.driver_id, "Yard move recorded"),
                Err(e) => warn!(error = %e, "Yard move event could not be persisted"),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shift sessions
    // ------------------------------------------------------------------------

    /// Begin a shift. Reporting rollups only — HOS math is unaffected.
    pub fn clock_in(&mut self, at: DateTime<Utc>) {
        if self.shift.is_some() {
            warn!(driver = %self.driver_id, "clock_in with a shift already open — keeping it");
            return;
        }
        self.shift = Some(ShiftSession::start(&self.driver_id, &self.vehicle_id, at));
        info!(driver = %self.driver_id, "Shift started");
    }

    /// End the shift and persist its rollup.
    pub fn clock_out(&mut self, at: DateTime<Utc>) -> Result<(), RecordError> {
        let Some(mut shift) = self.shift.take() else {
            return Err(RecordError::Validation("no open shift".to_string()));
        };
        shift.clock_out = Some(at);
        self.log.store_shift(&shift)?;
        info!(
            driver = %self.driver_id,
            events = shift.events_recorded,
            forced_stops = shift.forced_stops,
            "Shift closed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Persist a duty event, then commit and fan out. Append-before-commit:
    /// a failed write leaves the machine on its last committed state.
    fn persist_and_fanout(
        &mut self,
        event: DutyStatusEvent,
    ) -> Result<Vec<HosSignal>, StorageError> {
        let domain = DomainEvent::DutyStatus(event.clone());
        let key = self.log.append(&domain)?;
        self.machine.commit(&event);
        let signals = self.calculator.observe(&event);

        if let Err(e) = self.queue.enqueue_event(&domain, key) {
            // The event is durable; sync will lag until the queue recovers
            warn!(error = %e, "Committed event could not be queued for sync");
        }
        self.sync_wake.notify_one();

        if let Some(shift) = &mut self.shift {
            shift.events_recorded += 1;
            if event.yard_move {
                shift.yard_moves += 1;
            }
            if event.cause == TransitionCause::SystemForced {
                shift.forced_stops += 1;
            }
        }
        Ok(signals)
    }

    /// Apply calculator signals: advisories out, forced stops and the
    /// driving lock in.
    fn handle_signals(&mut self, signals: &[HosSignal], at: DateTime<Utc>) {
        for signal in signals {
            match *signal {
                HosSignal::Warning {
                    limit,
                    remaining_secs,
                } => {
                    self.sink.notify(Advisory {
                        driver_id: self.driver_id.clone(),
                        severity: AdvisorySeverity::Warning,
                        kind: AdvisoryKind::LimitWarning {
                            limit,
                            remaining_secs,
                        },
                        message: format!(
                            "{} minutes until the {}",
                            remaining_secs / 60,
                            limit
                        ),
                        at,
                    });
                }
                HosSignal::Violation { limit } => {
                    self.force_off_duty(at, Some(limit));
                }
                HosSignal::BreakCompleted => {
                    if self.machine.driving_locked() {
                        info!(driver = %self.driver_id, "Qualifying break recorded — driving unlocked");
                    }
                    self.machine.unlock_driving();
                    self.sink.notify(Advisory {
                        driver_id: self.driver_id.clone(),
                        severity: AdvisorySeverity::Info,
                        kind: AdvisoryKind::BreakCompleted,
                        message: "30-minute break complete".to_string(),
                        at,
                    });
                }
                HosSignal::RestartCompleted => {
                    self.machine.unlock_driving();
                    self.sink.notify(Advisory {
                        driver_id: self.driver_id.clone(),
                        severity: AdvisorySeverity::Info,
                        kind: AdvisoryKind::RestartCompleted,
                        message: "34-hour restart complete — rolling windows reset".to_string(),
                        at,
                    });
                }
            }
        }
    }

    /// Force an on-duty driver to `OffDuty` for compliance and lock further
    /// driving. The only path by which the calculator's verdict mutates
    /// duty state, and it still goes through the transition validator.
    fn force_off_duty(&mut self, at: DateTime<Utc>, limit: Option<LimitKind>) {
        self.machine.lock_driving();

        if self.machine.current().is_on_duty() {
            let request = TransitionRequest {
                target: DutyStatus::OffDuty,
                cause: TransitionCause::SystemForced,
                occurred_at: at,
                reason: limit.map(|l| format!("forced stop: {} reached", l)),
                gps: self.last_gps,
                source_confidence: 1.0,
                corrects: None,
            };
            match self.machine.validate(&request, true) {
                Ok(()) => {
                    let event = self.machine.build(&request);
                    if let Err(e) = self.persist_and_fanout(event) {
                        warn!(error = %e, "Forced stop event could not be persisted");
                    }
                    self.debouncer.reset();
                }
                Err(e) => warn!(error = %e, "Forced stop rejected by validator"),
            }
        }

        let limit_text = limit.map_or_else(
            || "an HOS limit".to_string(),
            |l| l.to_string(),
        );
        self.sink.notify(Advisory {
            driver_id: self.driver_id.clone(),
            severity: AdvisorySeverity::Critical,
            kind: AdvisoryKind::LimitViolation {
                limit: limit.unwrap_or(LimitKind::DailyDrive),
            },
            message: format!(
                "Driving stopped: {} reached. A qualifying break is required.",
                limit_text
            ),
            at,
        });
    }

    /// The limit currently pinning the drive allowance to zero, if any.
    fn binding_limit(&self) -> Option<LimitKind> {
        let remaining = self.calculator.remaining();
        if remaining.drive_secs == 0 {
            Some(LimitKind::DailyDrive)
        } else if remaining.until_break_due_secs == 0 {
            Some(LimitKind::BreakRequired)
        } else if remaining.duty_secs == 0 {
            Some(LimitKind::DailyDuty)
        } else if remaining.rolling_secs == 0 {
            Some(LimitKind::RollingWindow)
        } else {
            None
        }
    }
}

// ============================================================================
// Session Actor
// ============================================================================

/// Commands serialized through the session's single writer.
pub enum SessionCommand {
    RequestTransition {
        target: DutyStatus,
        cause: TransitionCause,
        reason: Option<String>,
        gps: Option<GpsFix>,
        token: Option<StateToken>,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<StateToken, TransitionError>>,
    },
    RecordEvent {
        event: DomainEvent,
        reply: oneshot::Sender<Result<(), RecordError>>,
    },
    Snapshot {
        reply: oneshot::Sender<HosWindow>,
    },
    Status {
        reply: oneshot::Sender<(DutyStatus, StateToken)>,
    },
    ClockIn {
        at: DateTime<Utc>,
        reply: oneshot::Sender<()>,
    },
    ClockOut {
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<(), RecordError>>,
    },
}

/// Cheap handle for the UI/dispatcher layer to reach a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn request_transition(
        &self,
        target: DutyStatus,
        cause: TransitionCause,
        reason: Option<String>,
        gps: Option<GpsFix>,
        token: Option<StateToken>,
        at: DateTime<Utc>,
    ) -> Result<StateToken, TransitionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::RequestTransition {
                target,
                cause,
                reason,
                gps,
                token,
                at,
                reply,
            })
            .await
            .map_err(|_| TransitionError::SessionClosed)?;
        rx.await.map_err(|_| TransitionError::SessionClosed)?
    }

    pub async fn record_event(&self, event: DomainEvent) -> Result<(), RecordError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::RecordEvent { event, reply })
            .await
            .map_err(|_| RecordError::SessionClosed)?;
        rx.await.map_err(|_| RecordError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Option<HosWindow> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn status(&self) -> Option<(DutyStatus, StateToken)> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn clock_in(&self, at: DateTime<Utc>) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::ClockIn { at, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn clock_out(&self, at: DateTime<Utc>) -> Result<(), RecordError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::ClockOut { at, reply })
            .await
            .map_err(|_| RecordError::SessionClosed)?;
        rx.await.map_err(|_| RecordError::SessionClosed)?
    }
}

/// Spawn the session loop; returns the command handle and the join handle
/// (which yields the session back for inspection after shutdown).
pub fn spawn_session<S: TelemetrySource>(
    session: DriverSession,
    source: S,
    cancel: CancellationToken,
) -> (SessionHandle, tokio::task::JoinHandle<DriverSession>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = SessionHandle { tx };
    let join = tokio::spawn(run_session(session, source, rx, cancel));
    (handle, join)
}

/// The session loop: one writer, fed by telemetry and serialized commands.
async fn run_session<S: TelemetrySource>(
    mut session: DriverSession,
    mut source: S,
    mut commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
) -> DriverSession {
    info!(
        driver = %session.driver_id,
        source = source.source_name(),
        "Driver session started"
    );
    let mut telemetry_done = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => {
                match command {
                    Some(command) => session.handle_command(command),
                    None => break,
                }
            }
            result = source.next_sample(), if !telemetry_done => {
                match result {
                    Ok(SampleEvent::Sample(sample)) => session.ingest_sample(sample),
                    Ok(SampleEvent::Eof) => {
                        info!(driver = %session.driver_id, "Telemetry source ended");
                        telemetry_done = true;
                    }
                    Err(e) => {
                        warn!(driver = %session.driver_id, error = %e, "Telemetry source error");
                        telemetry_done = true;
                    }
                }
            }
        }
    }

    info!(driver = %session.driver_id, "Driver session stopped");
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelSink;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap()
    }

    fn sample(at: DateTime<Utc>, speed: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: at,
            speed_mph: speed,
            engine_on: true,
            gps: None,
            confidence: 1.0,
        }
    }

    fn open_session(
        tmp: &tempfile::TempDir,
        sink: Arc<dyn NotificationSink>,
    ) -> (DriverSession, EventLog, SyncQueue) {
        let config = DeviceConfig::default();
        let log = EventLog::open(tmp.path()).unwrap();
        let queue = SyncQueue::open(tmp.path()).unwrap();
        let session = DriverSession::open(
            &config,
            HosProfile::us_70h_8d(),
            log.clone(),
            queue.clone(),
            sink,
            Arc::new(Notify::new()),
        )
        .unwrap();
        (session, log, queue)
    }

    fn drive_for(session: &mut DriverSession, from: DateTime<Utc>, minutes: i64) {
        // One sample per second for the debounce window, then one per
        // minute — enough for the calculator to track the clock
        for s in 0..=61 {
            session.ingest_sample(sample(from + Duration::seconds(s), 45.0));
        }
        for m in 2..=minutes {
            session.ingest_sample(sample(from + Duration::minutes(m), 45.0));
        }
    }

    #[test]
    fn test_sustained_motion_auto_switches_to_driving() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));

        assert_eq!(session.current_status(), DutyStatus::OffDuty);
        drive_for(&mut session, t0(), 5);
        assert_eq!(session.current_status(), DutyStatus::Driving);

        let events = log.scan_driver("DRIVER-0001").unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DomainEvent::DutyStatus(e) => {
                assert_eq!(e.status, DutyStatus::Driving);
                assert_eq!(e.cause, TransitionCause::AutoSwitch);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_manual_off_duty_requires_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, _log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));

        session
            .request_transition(
                DutyStatus::OnDutyNotDriving,
                TransitionCause::Manual,
                None,
                None,
                None,
                t0(),
            )
            .unwrap();

        let err = session
            .request_transition(
                DutyStatus::OffDuty,
                TransitionCause::Manual,
                None,
                None,
                None,
                t0() + Duration::minutes(1),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::Validation(_)));
    }

    #[test]
    fn test_stale_token_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, _log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));

        let stale = session.state_token();
        session
            .request_transition(
                DutyStatus::OnDutyNotDriving,
                TransitionCause::Manual,
                None,
                None,
                Some(stale),
                t0(),
            )
            .unwrap();

        // A second command still carrying the old token loses the race
        let err = session
            .request_transition(
                DutyStatus::Driving,
                TransitionCause::Manual,
                None,
                None,
                Some(stale),
                t0() + Duration::seconds(1),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::ConcurrentTransition { .. }));
    }

    #[test]
    fn test_eleven_hour_drive_forces_off_duty() {
        // Scenario: 10h45m accumulated, telemetry keeps reporting motion —
        // forced OffDuty at the 11h mark, Critical advisory, driving locked
        let tmp = tempfile::tempdir().unwrap();
        let (sink, mut advisories) = ChannelSink::new();
        let (mut session, log, _queue) = open_session(&tmp, sink);

        // Qualifying break after 5h keeps the 8h sub-window clear
        drive_for(&mut session, t0(), 300);
        session
            .request_transition(
                DutyStatus::OffDuty,
                TransitionCause::Manual,
                Some("meal break".to_string()),
                None,
                None,
                t0() + Duration::minutes(300),
            )
            .unwrap();

        let resume = t0() + Duration::minutes(330);
        drive_for(&mut session, resume, 345);
        // 5h + 5h45m driven; now continue past the 11h mark
        for m in 346..=365 {
            session.ingest_sample(sample(resume + Duration::minutes(m), 45.0));
        }

        assert_eq!(session.current_status(), DutyStatus::OffDuty);

        let events = log.scan_driver("DRIVER-0001").unwrap();
        let forced: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                DomainEvent::DutyStatus(d) if d.cause == TransitionCause::SystemForced => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].status, DutyStatus::OffDuty);
        // Driving resumed at resume+1min (debounce), first stint was 299
        // minutes, so the 11h mark lands exactly at resume+362min
        assert_eq!(forced[0].occurred_at, resume + Duration::minutes(362));

        let mut saw_critical = false;
        while let Ok(advisory) = advisories.try_recv() {
            if advisory.severity == AdvisorySeverity::Critical {
                saw_critical = true;
            }
        }
        assert!(saw_critical);

        // Driving stays locked without a qualifying break
        let err = session
            .request_transition(
                DutyStatus::Driving,
                TransitionCause::Manual,
                None,
                None,
                None,
                resume + Duration::minutes(370),
            )
            .unwrap_err();
        assert!(matches!(err, TransitionError::LimitExceeded));
    }

    #[test]
    fn test_break_resets_subwindow_and_unlocks() {
        // Scenario: 30-minute break after 5h30m resets the 8h sub-window
        // but leaves the daily total at 5h30m
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, _log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));

        drive_for(&mut session, t0(), 330);
        session
            .request_transition(
                DutyStatus::OffDuty,
                TransitionCause::Manual,
                Some("rest".to_string()),
                None,
                None,
                t0() + Duration::minutes(330),
            )
            .unwrap();

        // Let the 30 minutes elapse
        session.ingest_sample(sample(t0() + Duration::minutes(361), 0.0));

        let window = session.hos_window();
        assert_eq!(window.drive_secs_since_break, 0);
        // Driving began one debounce window after t0
        assert_eq!(window.drive_secs_today, 329 * 60);
    }

    #[test]
    fn test_yard_move_recorded_not_promoted() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));

        session
            .request_transition(
                DutyStatus::OnDutyNotDriving,
                TransitionCause::Manual,
                None,
                None,
                None,
                t0(),
            )
            .unwrap();

        // Creep across the yard at 3 mph for the full debounce window
        for s in 0..=61 {
            session.ingest_sample(sample(t0() + Duration::seconds(s), 3.0));
        }

        assert_eq!(session.current_status(), DutyStatus::OnDutyNotDriving);
        let events = log.scan_driver("DRIVER-0001").unwrap();
        let yard: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DomainEvent::DutyStatus(d) if d.yard_move))
            .collect();
        assert_eq!(yard.len(), 1);

        // Yard movement never accumulates drive time
        assert_eq!(session.hos_window().drive_secs_today, 0);
    }

    #[test]
    fn test_session_rebuilds_from_log_after_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let before;
        {
            let (mut session, _log, _queue) =
                open_session(&tmp, Arc::new(crate::notify::NullSink));
            drive_for(&mut session, t0(), 120);
            session
                .request_transition(
                    DutyStatus::OnDutyNotDriving,
                    TransitionCause::Manual,
                    None,
                    None,
                    None,
                    t0() + Duration::minutes(120),
                )
                .unwrap();
            before = session.hos_window();
        }
        {
            let (session, _log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));
            assert_eq!(session.current_status(), DutyStatus::OnDutyNotDriving);
            let after = session.hos_window();
            assert_eq!(after.drive_secs_today, before.drive_secs_today);
            assert_eq!(after.drive_secs_since_break, before.drive_secs_since_break);
        }
    }

    #[test]
    fn test_record_event_rejects_wrong_driver() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut session, _log, _queue) = open_session(&tmp, Arc::new(crate::notify::NullSink));

        let foreign = DomainEvent::Incident(crate::types::IncidentEvent {
            event_id: uuid::Uuid::new_v4(),
            driver_id: "SOMEONE-ELSE".to_string(),
            vehicle_id: "V1".to_string(),
            occurred_at: t0(),
            description: "scrape".to_string(),
            gps: None,
        });
        assert!(matches!(
            session.record_event(foreign),
            Err(RecordError::Validation(_))
        ));
    }
}

impl DriverSession {
    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::RequestTransition {
                target,
                cause,
                reason,
                gps,
                token,
                at,
                reply,
            } => {
                let result = self.request_transition(target, cause, reason, gps, token, at);
                let _ = reply.send(result);
            }
            SessionCommand::RecordEvent { event, reply } => {
                let _ = reply.send(self.record_event(event));
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.hos_window());
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send((self.current_status(), self.state_token()));
            }
            SessionCommand::ClockIn { at, reply } => {
                self.clock_in(at);
                let _ = reply.send(());
            }
            SessionCommand::ClockOut { at, reply } => {
                let _ = reply.send(self.clock_out(at));
            }
        }
    }
}
