//! eldcore: device-resident ELD compliance engine
//!
//! Enforces Hours-of-Service duty-status rules in real time, independent
//! of connectivity, and durably queues all field-captured data for
//! priority-ordered synchronization to the fleet backend.
//!
//! ## Architecture
//!
//! - **Duty-Status State Machine**: telemetry + manual commands, one
//!   immutable event per transition
//! - **HOS Limit Calculator**: pure, replayable rolling-window accumulators
//! - **Durable Event Log**: append-only, crash-safe sled store — the single
//!   source of truth
//! - **Sync Queue Manager**: priority classification, batching, capped
//!   backoff, checksum-verified acknowledgement
//! - **Conflict Resolver**: server-wins re-linking with a persisted audit
//!   trail

pub mod config;
pub mod connectivity;
pub mod duty;
pub mod hos;
pub mod notify;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod types;

// Re-export device configuration
pub use config::DeviceConfig;

// Re-export commonly used types
pub use types::{
    DeliveryEvent, DomainEvent, DutyStatus, DutyStatusEvent, FuelEvent, GpsFix,
    IncidentEvent, InspectionEvent, Priority, ShiftSession, TelemetryRollupEvent,
    TransitionCause,
};

// Re-export the state machine and session
pub use duty::{
    spawn_session, DriverSession, DutyStateMachine, SessionHandle, StateToken,
    TransitionError,
};

// Re-export the calculator
pub use hos::{HosCalculator, HosProfile, HosSignal, HosWindow, LimitKind};

// Re-export storage
pub use storage::{EventLog, ProcessLock, StorageError};

// Re-export sync components
pub use sync::{
    BatchBudgets, ConflictRecord, ConflictResolver, HttpTransport, SyncQueue,
    SyncTransport, SyncWorker, SyncWorkerConfig, TransportError,
};

// Re-export connectivity and notifications
pub use connectivity::{BandwidthClass, ConnectivityMonitor, LinkState};
pub use notify::{Advisory, AdvisoryKind, AdvisorySeverity, NotificationSink};
