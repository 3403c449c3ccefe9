//! Shared data structures for the ELD compliance engine
//!
//! This module defines the core types flowing through the engine:
//! - Duty status and transition causes (state machine vocabulary)
//! - `DutyStatusEvent` and the other field-captured domain events
//! - Sync priority classification
//! - Shift sessions for reporting rollups

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Duty Status
// ============================================================================

/// Regulatory duty status of a driver
///
/// The four FMCSA duty statuses. `Driving` accumulates against the daily
/// drive limit; `Driving` and `OnDutyNotDriving` both accumulate against
/// the daily on-duty limit and the rolling 7/8-day windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
pub enum DutyStatus {
    #[default]
    OffDuty,
    SleeperBerth,
    OnDutyNotDriving,
    Driving,
}

impl DutyStatus {
    /// Get display name for logs and the UI layer
    pub fn display_name(&self) -> &'static str {
        match self {
            DutyStatus::OffDuty => "Off Duty",
            DutyStatus::SleeperBerth => "Sleeper Berth",
            DutyStatus::OnDutyNotDriving => "On Duty (Not Driving)",
            DutyStatus::Driving => "Driving",
        }
    }

    /// Get short code for compact logging
    pub fn short_code(&self) -> &'static str {
        match self {
            DutyStatus::OffDuty => "OFF",
            DutyStatus::SleeperBerth => "SB",
            DutyStatus::OnDutyNotDriving => "ON",
            DutyStatus::Driving => "D",
        }
    }

    /// True for statuses that count toward on-duty accumulators
    pub fn is_on_duty(&self) -> bool {
        matches!(self, DutyStatus::OnDutyNotDriving | DutyStatus::Driving)
    }

    /// True for statuses that qualify as rest (break / restart eligibility)
    pub fn is_rest(&self) -> bool {
        matches!(self, DutyStatus::OffDuty | DutyStatus::SleeperBerth)
    }
}

impl std::fmt::Display for DutyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// What initiated a duty-status transition
///
/// Closed set, exhaustively matched at every validation site. Adding a
/// variant is a breaking change by design: every consumer must decide how
/// to treat a new cause.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransitionCause {
    /// Driver (or dispatcher, through the same command interface) requested it
    Manual,
    /// Telemetry debouncer detected sustained motion or stop
    AutoSwitch,
    /// Engine forced the transition for compliance (hard limit reached)
    SystemForced,
}

impl TransitionCause {
    pub fn short_code(&self) -> &'static str {
        match self {
            TransitionCause::Manual => "MAN",
            TransitionCause::AutoSwitch => "AUTO",
            TransitionCause::SystemForced => "FORCED",
        }
    }
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_code())
    }
}

// ============================================================================
// GPS
// ============================================================================

/// A GPS fix attached to an event (optional — devices may lack a fix indoors)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
}

// ============================================================================
// Domain Events
// ============================================================================

/// A duty-status transition, immutable once persisted
///
/// Corrections never edit an existing event; they append a new `Manual`
/// event whose `corrects` field links back to the event being annotated,
/// preserving the full audit history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DutyStatusEvent {
    pub event_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub status: DutyStatus,
    pub cause: TransitionCause,
    pub occurred_at: DateTime<Utc>,
    pub gps: Option<GpsFix>,
    /// Confidence of the triggering source, 0.0–1.0 (1.0 for manual commands)
    pub source_confidence: f64,
    /// Movement below the driving speed threshold — excluded from drive time
    pub yard_move: bool,
    /// Required for manual OffDuty / SleeperBerth declarations
    pub reason: Option<String>,
    /// Event this one corrects/annotates (audit link, never a replacement)
    pub corrects: Option<Uuid>,
}

/// A driver vehicle inspection report (pre-trip / post-trip / roadside)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InspectionEvent {
    pub event_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub occurred_at: DateTime<Utc>,
    pub passed: bool,
    pub defects: Vec<String>,
    pub notes: Option<String>,
}

/// An incident report (accident, cargo, roadside stop)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentEvent {
    pub event_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub occurred_at: DateTime<Utc>,
    pub description: String,
    pub gps: Option<GpsFix>,
}

/// A proof-of-delivery confirmation against a dispatched route stop
///
/// `route_version` is the version of the route the device knew when the
/// stop was completed. The backend may have moved on — the Conflict
/// Resolver re-links the fact against the current server version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryEvent {
    pub event_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub occurred_at: DateTime<Utc>,
    pub route_id: String,
    pub stop_id: String,
    pub route_version: u64,
    pub signature_ref: Option<String>,
}

/// A fuel purchase / MPG record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuelEvent {
    pub event_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub occurred_at: DateTime<Utc>,
    pub gallons: f64,
    pub odometer_miles: f64,
}

/// An aggregated telemetry/performance rollup (lowest sync priority)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRollupEvent {
    pub event_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub occurred_at: DateTime<Utc>,
    pub window_secs: u64,
    pub miles_driven: f64,
    pub avg_speed_mph: f64,
}

/// Every field-captured event the engine persists and synchronizes
///
/// The event log stores these; the sync queue classifies them (see
/// [`DomainEvent::priority`]). Accessors match exhaustively so a new
/// variant cannot be added without deciding its identity and priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    DutyStatus(DutyStatusEvent),
    Inspection(InspectionEvent),
    Incident(IncidentEvent),
    Delivery(DeliveryEvent),
    Fuel(FuelEvent),
    TelemetryRollup(TelemetryRollupEvent),
}

impl DomainEvent {
    pub fn event_id(&self) -> Uuid {
        match self {
            DomainEvent::DutyStatus(e) => e.event_id,
            DomainEvent::Inspection(e) => e.event_id,
            DomainEvent::Incident(e) => e.event_id,
            DomainEvent::Delivery(e) => e.event_id,
            DomainEvent::Fuel(e) => e.event_id,
            DomainEvent::TelemetryRollup(e) => e.event_id,
        }
    }

    pub fn driver_id(&self) -> &str {
        match self {
            DomainEvent::DutyStatus(e) => &e.driver_id,
            DomainEvent::Inspection(e) => &e.driver_id,
            DomainEvent::Incident(e) => &e.driver_id,
            DomainEvent::Delivery(e) => &e.driver_id,
            DomainEvent::Fuel(e) => &e.driver_id,
            DomainEvent::TelemetryRollup(e) => &e.driver_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::DutyStatus(e) => e.occurred_at,
            DomainEvent::Inspection(e) => e.occurred_at,
            DomainEvent::Incident(e) => e.occurred_at,
            DomainEvent::Delivery(e) => e.occurred_at,
            DomainEvent::Fuel(e) => e.occurred_at,
            DomainEvent::TelemetryRollup(e) => e.occurred_at,
        }
    }

    /// Sync priority classification
    ///
    /// Critical: safety/compliance data the backend must see first —
    /// failed inspections, incidents, and compliance-forced duty changes.
    pub fn priority(&self) -> Priority {
        match self {
            DomainEvent::Inspection(e) if !e.passed => Priority::Critical,
            DomainEvent::Incident(_) => Priority::Critical,
            DomainEvent::DutyStatus(e) => match e.cause {
                TransitionCause::SystemForced => Priority::Critical,
                TransitionCause::Manual | TransitionCause::AutoSwitch => Priority::High,
            },
            DomainEvent::Inspection(_) => Priority::Medium,
            DomainEvent::Fuel(_) => Priority::Medium,
            DomainEvent::Delivery(_) => Priority::Normal,
            DomainEvent::TelemetryRollup(_) => Priority::Low,
        }
    }

    /// Short label for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            DomainEvent::DutyStatus(_) => "duty_status",
            DomainEvent::Inspection(_) => "inspection",
            DomainEvent::Incident(_) => "incident",
            DomainEvent::Delivery(_) => "delivery",
            DomainEvent::Fuel(_) => "fuel",
            DomainEvent::TelemetryRollup(_) => "telemetry_rollup",
        }
    }
}

// ============================================================================
// Sync Priority
// ============================================================================

/// Sync priority class, strictly ordered at dequeue time
///
/// `Critical` is never batched with lower classes and is never starved.
/// Within a class, items dequeue FIFO by `occurred_at`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Normal,
    Low,
}

impl Priority {
    /// Dequeue rank — lower sorts first in the queue keyspace
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Priority> {
        match rank {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Normal),
            4 => Some(Priority::Low),
            _ => None,
        }
    }

    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Normal,
        Priority::Low,
    ];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Normal => "Normal",
            Priority::Low => "Low",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Shift Sessions
// ============================================================================

/// Groups events from clock-in to clock-out for one driver
///
/// Reporting rollups only. HOS math operates on rolling calendar time and
/// never consults shift boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShiftSession {
    pub session_id: Uuid,
    pub driver_id: String,
    pub vehicle_id: String,
    pub clock_in: DateTime<Utc>,
    pub clock_out: Option<DateTime<Utc>>,
    /// Events recorded during the shift
    pub events_recorded: u64,
    /// Yard-move annotations during the shift
    pub yard_moves: u64,
    /// Compliance-forced stops during the shift
    pub forced_stops: u64,
}

impl ShiftSession {
    pub fn start(driver_id: &str, vehicle_id: &str, clock_in: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            driver_id: driver_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            clock_in,
            clock_out: None,
            events_recorded: 0,
            yard_moves: 0,
            forced_stops: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duty_event(cause: TransitionCause) -> DomainEvent {
        DomainEvent::DutyStatus(DutyStatusEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            status: DutyStatus::OffDuty,
            cause,
            occurred_at: Utc::now(),
            gps: None,
            source_confidence: 1.0,
            yard_move: false,
            reason: Some("rest".to_string()),
            corrects: None,
        })
    }

    #[test]
    fn test_priority_classification() {
        assert_eq!(
            duty_event(TransitionCause::SystemForced).priority(),
            Priority::Critical
        );
        assert_eq!(duty_event(TransitionCause::Manual).priority(), Priority::High);
        assert_eq!(
            duty_event(TransitionCause::AutoSwitch).priority(),
            Priority::High
        );

        let failed_inspection = DomainEvent::Inspection(InspectionEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            occurred_at: Utc::now(),
            passed: false,
            defects: vec!["brake line".to_string()],
            notes: None,
        });
        assert_eq!(failed_inspection.priority(), Priority::Critical);

        let passed_inspection = DomainEvent::Inspection(InspectionEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            occurred_at: Utc::now(),
            passed: true,
            defects: Vec::new(),
            notes: None,
        });
        assert_eq!(passed_inspection.priority(), Priority::Medium);
    }

    #[test]
    fn test_priority_rank_round_trip() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn test_duty_status_predicates() {
        assert!(DutyStatus::Driving.is_on_duty());
        assert!(DutyStatus::OnDutyNotDriving.is_on_duty());
        assert!(!DutyStatus::OffDuty.is_on_duty());
        assert!(DutyStatus::OffDuty.is_rest());
        assert!(DutyStatus::SleeperBerth.is_rest());
        assert!(!DutyStatus::Driving.is_rest());
    }

    #[test]
    fn test_domain_event_serde_round_trip() {
        let event = duty_event(TransitionCause::Manual);
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
