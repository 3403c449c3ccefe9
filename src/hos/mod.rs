//! HOS Limit Calculator
//!
//! A pure, replayable function over a driver's duty-status event stream.
//! The calculator maintains incremental integer-second accumulators keyed
//! by day boundary in the driver's home-terminal timezone — floating point
//! never touches compliance math, and day boundaries follow the terminal,
//! not device wall clock.
//!
//! The calculator owns no events. It observes the committed log and holds
//! only derived, rebuildable state: discard it and replay the log to get
//! an identical [`HosWindow`].

mod calculator;

pub use calculator::HosCalculator;

use crate::config::HosConfig;
use crate::config::{ConfigError, Jurisdiction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Profile
// ============================================================================

/// Jurisdiction rule set resolved from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HosProfile {
    pub max_daily_drive_secs: u64,
    pub max_daily_duty_secs: u64,
    pub break_required_after_drive_secs: u64,
    pub qualifying_break_secs: u64,
    pub restart_secs: u64,
    /// Rolling window length in days (7 or 8)
    pub rolling_window_days: u32,
    /// Rolling on-duty cap over the window (60 h or 70 h)
    pub rolling_cap_secs: u64,
}

impl HosProfile {
    /// 70 hours on duty in any 8 consecutive days.
    pub fn us_70h_8d() -> Self {
        Self {
            max_daily_drive_secs: crate::config::defaults::MAX_DAILY_DRIVE_SECS,
            max_daily_duty_secs: crate::config::defaults::MAX_DAILY_DUTY_SECS,
            break_required_after_drive_secs:
                crate::config::defaults::BREAK_REQUIRED_AFTER_DRIVE_SECS,
            qualifying_break_secs: crate::config::defaults::QUALIFYING_BREAK_SECS,
            restart_secs: crate::config::defaults::RESTART_SECS,
            rolling_window_days: 8,
            rolling_cap_secs: 70 * 3600,
        }
    }

    /// 60 hours on duty in any 7 consecutive days.
    pub fn us_60h_7d() -> Self {
        Self {
            rolling_window_days: 7,
            rolling_cap_secs: 60 * 3600,
            ..Self::us_70h_8d()
        }
    }

    /// Resolve the profile from device config (jurisdiction + overrides).
    pub fn from_config(hos: &HosConfig) -> Result<Self, ConfigError> {
        let base = match hos.jurisdiction()? {
            Jurisdiction::Us60h7d => Self::us_60h_7d(),
            Jurisdiction::Us70h8d => Self::us_70h_8d(),
        };
        Ok(Self {
            max_daily_drive_secs: hos.max_daily_drive_secs,
            max_daily_duty_secs: hos.max_daily_duty_secs,
            break_required_after_drive_secs: hos.break_required_after_drive_secs,
            qualifying_break_secs: hos.qualifying_break_secs,
            restart_secs: hos.restart_secs,
            ..base
        })
    }
}

// ============================================================================
// Limits and Signals
// ============================================================================

/// Which HOS limit a warning or violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitKind {
    /// Daily driving limit (11 h)
    DailyDrive,
    /// Daily on-duty limit (14 h)
    DailyDuty,
    /// 30-minute break due (8 h cumulative driving since last break)
    BreakRequired,
    /// Rolling 60 h / 7 d or 70 h / 8 d window
    RollingWindow,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LimitKind::DailyDrive => "daily drive limit",
            LimitKind::DailyDuty => "daily on-duty limit",
            LimitKind::BreakRequired => "30-minute break",
            LimitKind::RollingWindow => "rolling on-duty window",
        };
        write!(f, "{}", name)
    }
}

/// Signals emitted by the calculator as time and events are observed.
///
/// Warnings and violations are advisory outputs routed to the notification
/// sink; they are never persisted as duty-status events. A `Violation` is
/// the calculator instructing the state machine to force `Driving → OffDuty`
/// — always mediated through the transition validator, never by writing
/// events directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HosSignal {
    /// Approaching a hard limit (emitted once per 60/30/15/5-minute mark)
    Warning {
        limit: LimitKind,
        remaining_secs: u64,
    },
    /// A hard limit has been reached
    Violation { limit: LimitKind },
    /// A qualifying break completed; the 8 h sub-window reset to zero
    BreakCompleted,
    /// A 34 h restart completed; both rolling windows reset to zero
    RestartCompleted,
}

// ============================================================================
// Derived Window Snapshot
// ============================================================================

/// Point-in-time view of a driver's HOS accumulators.
///
/// Derived, never stored: always recomputed from the event log, so cached
/// counters cannot drift from the source events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HosWindow {
    pub drive_secs_today: u64,
    pub on_duty_secs_today: u64,
    pub rolling_7day_secs: u64,
    pub rolling_8day_secs: u64,
    pub drive_secs_since_break: u64,
    pub last_break_end: Option<DateTime<Utc>>,
    pub last_34h_restart: Option<DateTime<Utc>>,
    pub as_of: DateTime<Utc>,
}

/// Remaining allowance before each hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remaining {
    pub drive_secs: u64,
    pub duty_secs: u64,
    pub until_break_due_secs: u64,
    pub rolling_secs: u64,
}

impl Remaining {
    /// Effective driving allowance: the binding constraint across all limits.
    pub fn effective_drive_secs(&self) -> u64 {
        self.drive_secs
            .min(self.duty_secs)
            .min(self.until_break_due_secs)
            .min(self.rolling_secs)
    }
}
