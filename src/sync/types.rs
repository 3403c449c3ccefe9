//! Sync wire types — queue items, batches, acknowledgements, conflicts.

use crate::storage::EventKey;
use crate::types::{DomainEvent, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Checksums
// ============================================================================

/// Hex MD5 digest of payload bytes.
///
/// Corruption detection on the transport path, not a security boundary —
/// the backend recomputes the digest and echoes it in the acknowledgement.
pub fn payload_checksum(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

// ============================================================================
// Queue Items
// ============================================================================

/// Lifecycle state of a queued item.
///
/// `Acknowledged` items are removed, so the stored states are the other
/// four. `Rejected` is terminal and surfaced, never silently dropped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncItemState {
    Pending,
    InFlight,
    Conflicted,
    Rejected,
}

/// One queued upload, pointing into the event log.
///
/// The payload itself stays in the immutable log; the queue holds only
/// routing metadata plus the checksum captured at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncQueueItem {
    pub item_id: Uuid,
    /// Event-log key of the payload
    pub payload_ref: EventKey,
    pub driver_id: String,
    pub priority: Priority,
    pub occurred_at: DateTime<Utc>,
    pub state: SyncItemState,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub checksum: String,
    /// Version of the server-side entity the payload references, if any
    /// (route version for deliveries) — used by the conflict resolver
    pub local_version: Option<u64>,
    /// Server version to re-link against after a ServerWins resolution
    pub link_override: Option<u64>,
}

impl SyncQueueItem {
    /// Build the queue item for a freshly appended event.
    ///
    /// The item id is the event id, which makes duplicate enqueue and
    /// duplicate transmission detectable end to end.
    pub fn for_event(
        event: &DomainEvent,
        payload_ref: EventKey,
        payload_bytes: &[u8],
    ) -> Self {
        let local_version = match event {
            DomainEvent::Delivery(d) => Some(d.route_version),
            _ => None,
        };
        Self {
            item_id: event.event_id(),
            payload_ref,
            driver_id: event.driver_id().to_string(),
            priority: event.priority(),
            occurred_at: event.occurred_at(),
            state: SyncItemState::Pending,
            attempt_count: 0,
            next_retry_at: None,
            checksum: payload_checksum(payload_bytes),
            local_version,
            link_override: None,
        }
    }
}

// ============================================================================
// Batches
// ============================================================================

/// One item as placed on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncEnvelope {
    pub item_id: Uuid,
    pub priority: Priority,
    pub checksum: String,
    pub event: DomainEvent,
}

/// A batch of same-priority items for one network round-trip.
///
/// Critical batches never contain lower classes and use a smaller byte
/// budget so the first acknowledgement lands fast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncBatch {
    pub batch_id: Uuid,
    pub device_id: String,
    pub driver_id: String,
    pub priority: Priority,
    pub items: Vec<SyncEnvelope>,
    /// Digest over the item checksums in order — the backend must echo it
    pub checksum: String,
}

impl SyncBatch {
    /// Batch digest: MD5 over the concatenated per-item checksums, in order.
    pub fn compute_checksum(items: &[SyncEnvelope]) -> String {
        let mut joined = String::with_capacity(items.len() * 32);
        for item in items {
            joined.push_str(&item.checksum);
        }
        payload_checksum(joined.as_bytes())
    }
}

/// Acknowledgement for one batch.
///
/// An item moves to `Acknowledged` only when the echoed checksum matches —
/// HTTP success alone never completes a transmission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchAck {
    pub batch_id: Uuid,
    /// Backend-recomputed batch checksum
    pub checksum: String,
    pub accepted: Vec<Uuid>,
    pub rejected: Vec<ItemRejection>,
    pub conflicts: Vec<ConflictNotice>,
}

/// A permanent (4xx-class validation) rejection of a single item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemRejection {
    pub item_id: Uuid,
    pub error: String,
}

// ============================================================================
// Conflicts
// ============================================================================

/// Server-reported conflict on a queued item's referenced entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictNotice {
    pub item_id: Uuid,
    pub kind: ConflictKind,
}

/// How the referenced entity diverged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Dispatch changed the entity; `server_version` is current
    VersionMismatch { server_version: u64 },
    /// The referenced entity no longer exists server-side
    ReferentDeleted,
}

/// Resolution applied to a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConflictResolution {
    ServerWins,
    LocalWins,
    Merged,
    PendingManual,
}

/// Audit record persisted for every detected conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub item_id: Uuid,
    pub driver_id: String,
    pub local_version: Option<u64>,
    pub server_version: Option<u64>,
    pub resolution: ConflictResolution,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable_hex() {
        let a = payload_checksum(b"hello");
        let b = payload_checksum(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_batch_checksum_depends_on_order() {
        let env = |id: &str| SyncEnvelope {
            item_id: Uuid::new_v4(),
            priority: Priority::Normal,
            checksum: payload_checksum(id.as_bytes()),
            event: sample_event(),
        };
        let first = env("a");
        let second = env("b");

        let forward = SyncBatch::compute_checksum(&[first.clone(), second.clone()]);
        let reverse = SyncBatch::compute_checksum(&[second, first]);
        assert_ne!(forward, reverse);
    }

    fn sample_event() -> DomainEvent {
        DomainEvent::Delivery(crate::types::DeliveryEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            occurred_at: Utc::now(),
            route_id: "R1".to_string(),
            stop_id: "S1".to_string(),
            route_version: 1,
            signature_ref: None,
        })
    }
}
