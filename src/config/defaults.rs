//! System-wide default constants.
//!
//! Centralises magic numbers so subsystems share one source of truth.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Telemetry / Auto-Switch
// ============================================================================

/// Speed above which sustained motion counts as driving (mph).
pub const DRIVING_SPEED_THRESHOLD_MPH: f64 = 5.0;

/// Continuous seconds above/below the speed threshold before an
/// auto-switch fires.
pub const MOTION_DEBOUNCE_SECS: u64 = 60;

/// Samples with confidence below this floor are ignored by the debouncer.
pub const TELEMETRY_MIN_CONFIDENCE: f64 = 0.5;

// ============================================================================
// Hours of Service
// ============================================================================

/// Daily driving limit (11 hours, in seconds).
pub const MAX_DAILY_DRIVE_SECS: u64 = 11 * 3600;

/// Daily on-duty limit (14 hours, in seconds).
pub const MAX_DAILY_DUTY_SECS: u64 = 14 * 3600;

/// Cumulative driving after which a break is required (8 hours, in seconds).
pub const BREAK_REQUIRED_AFTER_DRIVE_SECS: u64 = 8 * 3600;

/// Minimum contiguous rest that counts as a qualifying break (30 minutes).
pub const QUALIFYING_BREAK_SECS: u64 = 30 * 60;

/// Contiguous rest that restarts the rolling windows (34 hours).
pub const RESTART_SECS: u64 = 34 * 3600;

/// Advisory warning offsets before each hard limit, in seconds.
/// Emitted once per threshold per approach: 60, 30, 15, 5 minutes out.
pub const WARNING_OFFSETS_SECS: [u64; 4] = [3600, 1800, 900, 300];

// ============================================================================
// Event Log / Retention
// ============================================================================

/// Regulatory on-device retention floor (days). Config values below this
/// are rejected at validation.
pub const RETENTION_FLOOR_DAYS: u32 = 180;

/// How often the compaction sweep runs (seconds). 21 600 = 6 hours.
pub const COMPACTION_INTERVAL_SECS: u64 = 21_600;

// ============================================================================
// Sync Queue
// ============================================================================

/// Byte budget for a normal-class batch per network round-trip.
pub const BATCH_BYTE_BUDGET: usize = 64 * 1024;

/// Smaller byte budget for Critical batches (latency to first ack wins
/// over throughput for safety data).
pub const CRITICAL_BATCH_BYTE_BUDGET: usize = 8 * 1024;

/// HTTP timeout for sync requests (seconds). Network calls are always
/// bounded; a timed-out batch returns to Pending with one retry increment.
pub const SYNC_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Retry backoff schedule in seconds: 30s, 1m, 5m, 15m, 1h, then hourly.
pub const RETRY_BACKOFF_SECS: [u64; 5] = [30, 60, 300, 900, 3600];

/// Maximum jitter added to each backoff interval (seconds).
pub const RETRY_JITTER_SECS: u64 = 10;

/// Consecutive transport failures before a "sync delayed" warning is
/// surfaced to the notification sink.
pub const SYNC_DELAYED_WARNING_CEILING: u32 = 5;

/// Idle re-check interval for the sync worker (seconds). Bounds how long
/// a backed-off item waits past its due time.
pub const SYNC_IDLE_POLL_SECS: u64 = 5;

/// Repeated checksum failures on the same item before escalation.
pub const INTEGRITY_ESCALATION_THRESHOLD: u32 = 3;
