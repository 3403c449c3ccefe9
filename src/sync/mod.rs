//! Priority Sync Pipeline
//!
//! Wraps the event log with priority classification, batching, retry with
//! capped backoff, checksum-verified acknowledgement, and conflict
//! resolution against authoritative server state. Safety and compliance
//! data always leaves the device before routine operational data.

pub mod conflict;
pub mod queue;
pub mod transport;
pub mod types;
mod worker;

pub use conflict::ConflictResolver;
pub use queue::{BatchBudgets, PreparedBatch, QueueError, QueueStats, SyncQueue};
pub use transport::{HttpTransport, SyncTransport, TransportError};
pub use types::{
    payload_checksum, BatchAck, ConflictKind, ConflictNotice, ConflictRecord,
    ConflictResolution, ItemRejection, SyncBatch, SyncEnvelope, SyncItemState, SyncQueueItem,
};
pub use worker::{SyncWorker, SyncWorkerConfig};
