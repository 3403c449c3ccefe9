//! Notification sink — advisory/limit events for the external UI layer.
//!
//! Fire-and-forget and best-effort by contract: a lost notification never
//! affects compliance correctness. The engine's source of truth is the
//! event log; advisories are a courtesy to the human in the cab.

use crate::hos::LimitKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Advisory severity, mapped by the external layer onto UI/push channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AdvisorySeverity {
    Info,
    Warning,
    Critical,
}

/// What the advisory is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AdvisoryKind {
    /// Approaching an HOS hard limit
    LimitWarning {
        limit: LimitKind,
        remaining_secs: u64,
    },
    /// HOS hard limit reached; the engine forced a stop
    LimitViolation { limit: LimitKind },
    /// A qualifying break completed; driving is available again
    BreakCompleted,
    /// A 34 h restart completed
    RestartCompleted,
    /// Retries exhausted past the ceiling; data is safe but delayed
    SyncDelayed { pending: usize },
    /// An item was held for manual conflict resolution
    ConflictHeld { item_id: Uuid },
    /// The backend permanently rejected an item
    SyncRejected { item_id: Uuid, error: String },
    /// Part of the compliance record is unreadable and quarantined
    RecordIncomplete { day_index: u64 },
}

/// One advisory event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Advisory {
    pub driver_id: String,
    pub severity: AdvisorySeverity,
    pub kind: AdvisoryKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Sink for advisories. Implementations must never block the caller.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, advisory: Advisory);
}

/// Logs advisories through `tracing` — the default sink for headless runs.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, advisory: Advisory) {
        match advisory.severity {
            AdvisorySeverity::Critical | AdvisorySeverity::Warning => warn!(
                driver = %advisory.driver_id,
                severity = ?advisory.severity,
                "{}",
                advisory.message
            ),
            AdvisorySeverity::Info => info!(
                driver = %advisory.driver_id,
                "{}",
                advisory.message
            ),
        }
    }
}

/// Forwards advisories into an unbounded channel (UI bridge, tests).
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<Advisory>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<Advisory>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, advisory: Advisory) {
        // Receiver gone means the UI detached; advisories are best-effort
        let _ = self.tx.send(advisory);
    }
}

/// Discards everything. For tests that don't care.
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _advisory: Advisory) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify(Advisory {
            driver_id: "D1".to_string(),
            severity: AdvisorySeverity::Warning,
            kind: AdvisoryKind::LimitWarning {
                limit: LimitKind::DailyDrive,
                remaining_secs: 1800,
            },
            message: "30 minutes of drive time remaining".to_string(),
            at: Utc::now(),
        });

        let advisory = rx.try_recv().unwrap();
        assert_eq!(advisory.severity, AdvisorySeverity::Warning);
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        // Must not panic — best-effort contract
        sink.notify(Advisory {
            driver_id: "D1".to_string(),
            severity: AdvisorySeverity::Info,
            kind: AdvisoryKind::BreakCompleted,
            message: "break complete".to_string(),
            at: Utc::now(),
        });
    }
}
