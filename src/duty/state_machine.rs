//! Duty-status transition validation and event construction.
//!
//! The machine holds the current status, a monotonically increasing
//! sequence number used for optimistic concurrency, and the post-violation
//! driving lock. It validates every requested transition — manual,
//! telemetry-driven, and compliance-forced alike — and builds exactly one
//! immutable [`DutyStatusEvent`] per applied transition.

use crate::types::{DutyStatus, DutyStatusEvent, GpsFix, TransitionCause};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Transition errors surfaced to command callers.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// Malformed command or missing required annotation. Surfaced
    /// immediately, never queued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Two transitions raced for the same driver; the losing request is
    /// rejected and the caller must retry with fresh state.
    #[error("concurrent transition: observed state seq {observed}, current is {current}")]
    ConcurrentTransition { observed: u64, current: u64 },

    /// HOS hard limit reached. Not a caller fault — always paired with a
    /// forced OffDuty transition and a Critical notification.
    #[error("HOS limit exceeded: driving is locked until a qualifying break is recorded")]
    LimitExceeded,

    /// The session task is gone (shutdown while a command was in flight).
    #[error("driver session is closed")]
    SessionClosed,

    /// The event could not be durably persisted; the transition did not
    /// take effect. Compliance-affecting, always surfaced.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Opaque token identifying the state a caller observed.
///
/// Commands carry the token back; a stale token means another transition
/// won the race and the command is rejected instead of silently applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateToken(pub u64);

/// A requested transition, from any authority (driver UI, dispatcher,
/// telemetry auto-switch, or the engine itself).
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub target: DutyStatus,
    pub cause: TransitionCause,
    pub occurred_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub gps: Option<GpsFix>,
    pub source_confidence: f64,
    /// Audit link when this event corrects an earlier one
    pub corrects: Option<Uuid>,
}

/// Per-driver duty-status state machine. Initial state at clock-in is
/// `OffDuty`.
#[derive(Debug)]
pub struct DutyStateMachine {
    driver_id: String,
    vehicle_id: String,
    current: DutyStatus,
    seq: u64,
    driving_locked: bool,
}

impl DutyStateMachine {
    pub fn new(driver_id: &str, vehicle_id: &str) -> Self {
        Self {
            driver_id: driver_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            current: DutyStatus::OffDuty,
            seq: 0,
            driving_locked: false,
        }
    }

    pub fn current(&self) -> DutyStatus {
        self.current
    }

    pub fn token(&self) -> StateToken {
        StateToken(self.seq)
    }

    pub fn driving_locked(&self) -> bool {
        self.driving_locked
    }

    /// Lock `Driving` transitions after a forced stop. Released only by a
    /// qualifying break.
    pub fn lock_driving(&mut self) {
        self.driving_locked = true;
    }

    pub fn unlock_driving(&mut self) {
        self.driving_locked = false;
    }

    /// Validate a requested transition against the machine's rules.
    ///
    /// `drive_allowed` is the calculator's verdict on remaining allowance;
    /// the machine itself owns the structural rules.
    pub fn validate(
        &self,
        request: &TransitionRequest,
        drive_allowed: bool,
    ) -> Result<(), TransitionError> {
        if request.target == self.current {
            return Err(TransitionError::Validation(format!(
                "already in status {}",
                self.current
            )));
        }

        // Exhaustive over the closed cause set: a new cause variant must
        // decide its rules here before the crate compiles again.
        match request.cause {
            TransitionCause::Manual => {
                if request.target.is_rest()
                    && request.reason.as_deref().map_or(true, str::is_empty)
                {
                    return Err(TransitionError::Validation(format!(
                        "a reason is required for manual transition to {}",
                        request.target
                    )));
                }
            }
            TransitionCause::AutoSwitch => {
                let valid_edge = matches!(
                    (self.current, request.target),
                    (
                        DutyStatus::OffDuty
                            | DutyStatus::SleeperBerth
                            | DutyStatus::OnDutyNotDriving,
                        DutyStatus::Driving
                    ) | (DutyStatus::Driving, DutyStatus::OnDutyNotDriving)
                );
                if !valid_edge {
                    return Err(TransitionError::Validation(format!(
                        "auto-switch cannot move {} to {}",
                        self.current, request.target
                    )));
                }
            }
            TransitionCause::SystemForced => {
                if request.target != DutyStatus::OffDuty {
                    return Err(TransitionError::Validation(
                        "forced transitions only target Off Duty".to_string(),
                    ));
                }
            }
        }

        if request.target == DutyStatus::Driving && (self.driving_locked || !drive_allowed) {
            return Err(TransitionError::LimitExceeded);
        }

        Ok(())
    }

    /// Build the immutable event for a validated transition.
    ///
    /// Does not mutate the machine: the event must be durably appended to
    /// the log first, then [`commit`](Self::commit)ted. A crash between
    /// the two leaves the machine on its last committed state.
    pub fn build(&self, request: &TransitionRequest) -> DutyStatusEvent {
        DutyStatusEvent {
            event_id: Uuid::new_v4(),
            driver_id: self.driver_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            status: request.target,
            cause: request.cause,
            occurred_at: request.occurred_at,
            gps: request.gps,
            source_confidence: request.source_confidence,
            yard_move: false,
            reason: request.reason.clone(),
            corrects: request.corrects,
        }
    }

    /// Build a yard-move annotation: movement below the driving threshold
    /// while on duty. Never a transition to `Driving`; the status stays
    /// `OnDutyNotDriving` and the event carries the `yard_move` flag so
    /// drive-time accumulation excludes it.
    pub fn build_yard_move(
        &self,
        occurred_at: DateTime<Utc>,
        gps: Option<GpsFix>,
        source_confidence: f64,
    ) -> DutyStatusEvent {
        DutyStatusEvent {
            event_id: Uuid::new_v4(),
            driver_id: self.driver_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            status: DutyStatus::OnDutyNotDriving,
            cause: TransitionCause::AutoSwitch,
            occurred_at,
            gps,
            source_confidence,
            yard_move: true,
            reason: None,
            corrects: None,
        }
    }

    /// Commit a persisted event: adopt its status and advance the sequence.
    pub fn commit(&mut self, event: &DutyStatusEvent) {
        self.current = event.status;
        self.seq += 1;
    }

    /// Restore machine state from the last committed event (crash recovery).
    pub fn restore(&mut self, status: DutyStatus, applied_events: u64) {
        self.current = status;
        self.seq = applied_events;
    }
}
