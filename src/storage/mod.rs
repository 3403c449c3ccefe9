//! Durable Event Log
//!
//! Append-only, crash-consistent store of domain events backed by sled.
//! Keys are `(driver_id, occurred_at, event_id)` encoded so that a prefix
//! scan per driver walks events in `occurred_at` order with `event_id` as
//! tiebreak. Every append is flushed before it returns — readers only ever
//! observe committed entries, so a crash between telemetry detection and
//! persistence cannot produce a ghost compliance state.
//!
//! Unreadable entries are quarantined rather than dropped: the raw bytes
//! move to a quarantine tree and the affected driver-day is flagged
//! incomplete for audit honesty.

mod event_log;
pub mod lockfile;

pub use event_log::{CompactionStats, EventKey, EventLog, LogStats, StorageError};
pub use lockfile::ProcessLock;
