//! Disk-backed priority queue for upload items.
//!
//! Items live in a sled tree whose key encodes `(priority rank,
//! occurred_at, item_id)`, so an in-order scan yields strict priority
//! ordering with FIFO inside each class. The queue survives restarts; the
//! scan on open resumes pending uploads from the last acknowledged
//! checkpoint. Conflicted and rejected items move to side trees so they
//! never block the active queue.

use super::types::{
    payload_checksum, ConflictRecord, SyncBatch, SyncEnvelope, SyncItemState, SyncQueueItem,
};
use crate::config::defaults::{RETRY_BACKOFF_SECS, RETRY_JITTER_SECS};
use crate::storage::{EventLog, StorageError};
use crate::types::{DomainEvent, Priority};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("event log error: {0}")]
    Storage(#[from] StorageError),
    #[error("unknown item {0}")]
    UnknownItem(Uuid),
}

/// Byte budgets per batch, by class.
#[derive(Debug, Clone, Copy)]
pub struct BatchBudgets {
    pub normal_bytes: usize,
    pub critical_bytes: usize,
}

/// A batch ready for transmission plus the queue keys backing it.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub batch: SyncBatch,
    pub keys: Vec<Vec<u8>>,
}

/// Per-class depth counts for diagnostics and queue-status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: BTreeMap<Priority, usize>,
    pub conflicted: usize,
    pub rejected: usize,
}

/// Durable priority sync queue for one device.
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<sled::Db>,
    active: sled::Tree,
    conflicted: sled::Tree,
    rejected: sled::Tree,
    conflict_records: sled::Tree,
}

impl SyncQueue {
    /// Open or create the queue under the given data directory.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, QueueError> {
        let db = sled::open(data_dir.as_ref().join("sync_queue"))?;
        let active = db.open_tree("active")?;
        let conflicted = db.open_tree("conflicted")?;
        let rejected = db.open_tree("rejected")?;
        let conflict_records = db.open_tree("conflict_records")?;

        let queue = Self {
            db: Arc::new(db),
            active,
            conflicted,
            rejected,
            conflict_records,
        };

        let pending: usize = queue.stats()?.pending.values().sum();
        if pending > 0 {
            info!(pending, "Sync queue opened with pending items");
        } else {
            debug!("Sync queue opened (empty)");
        }
        Ok(queue)
    }

    fn item_key(priority: Priority, occurred_at: DateTime<Utc>, item_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + 8 + 16);
        key.push(priority.rank());
        key.extend_from_slice(&(occurred_at.timestamp_millis().max(0) as u64).to_be_bytes());
        key.extend_from_slice(item_id.as_bytes());
        key
    }

    fn key_for(item: &SyncQueueItem) -> Vec<u8> {
        Self::item_key(item.priority, item.occurred_at, item.item_id)
    }

    // ------------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------------

    /// Enqueue a freshly committed event for upload.
    ///
    /// Idempotent: re-enqueueing the same event id is a no-op, so retry
    /// paths can call this safely.
    pub fn enqueue_event(
        &self,
        event: &DomainEvent,
        payload_ref: crate::storage::EventKey,
    ) -> Result<Uuid, QueueError> {
        let payload_bytes = serde_json::to_vec(event)?;
        let item = SyncQueueItem::for_event(event, payload_ref, &payload_bytes);
        let key = Self::key_for(&item);

        if self.active.contains_key(&key)? {
            debug!(item_id = %item.item_id, "Item already queued, skipping");
            return Ok(item.item_id);
        }
        self.active.insert(key, serde_json::to_vec(&item)?)?;
        self.db.flush()?;
        debug!(
            item_id = %item.item_id,
            priority = %item.priority,
            size_bytes = payload_bytes.len(),
            "Item queued for sync"
        );
        Ok(item.item_id)
    }

    // ------------------------------------------------------------------------
    // Dequeue
    // ------------------------------------------------------------------------

    /// Assemble the next batch: the highest-priority class with a due item,
    /// FIFO within the class, up to the class byte budget.
    ///
    /// Critical items are never mixed with lower classes and use the
    /// smaller budget. Returns `None` when nothing is due.
    pub fn next_batch(
        &self,
        log: &EventLog,
        now: DateTime<Utc>,
        budgets: BatchBudgets,
        device_id: &str,
    ) -> Result<Option<PreparedBatch>, QueueError> {
        let mut batch_priority: Option<Priority> = None;
        let mut envelopes: Vec<SyncEnvelope> = Vec::new();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut driver_id = String::new();
        let mut used_bytes = 0usize;

        for entry in self.active.iter() {
            let (key, value) = entry?;
            let item: SyncQueueItem = match serde_json::from_slice(&value) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Corrupted queue entry — removing");
                    self.active.remove(&key)?;
                    continue;
                }
            };

            if item.state != SyncItemState::Pending {
                continue;
            }
            if item.next_retry_at.is_some_and(|at| at > now) {
                continue;
            }
            // First due item pins the batch class; iteration order guarantees
            // no higher class had anything due
            match batch_priority {
                None => batch_priority = Some(item.priority),
                Some(p) if p != item.priority => break,
                Some(_) => {}
            }

            let Some(envelope) = self.build_envelope(log, &item)? else {
                // Payload unreadable: terminal for this item, never for the queue
                self.reject_key(&key, &item, "payload unreadable (quarantined)")?;
                continue;
            };

            let envelope_bytes = serde_json::to_vec(&envelope)?.len();
            let budget = if item.priority == Priority::Critical {
                budgets.critical_bytes
            } else {
                budgets.normal_bytes
            };
            if !envelopes.is_empty() && used_bytes + envelope_bytes > budget {
                break;
            }
            used_bytes += envelope_bytes;
            driver_id = item.driver_id.clone();
            envelopes.push(envelope);
            keys.push(key.to_vec());
        }

        let Some(priority) = batch_priority else {
            return Ok(None);
        };
        if envelopes.is_empty() {
            return Ok(None);
        }

        let checksum = SyncBatch::compute_checksum(&envelopes);
        Ok(Some(PreparedBatch {
            batch: SyncBatch {
                batch_id: Uuid::new_v4(),
                device_id: device_id.to_string(),
                driver_id,
                priority,
                items: envelopes,
                checksum,
            },
            keys,
        }))
    }

    /// Load the payload and wrap it for the wire, applying any re-link
    /// override from a ServerWins conflict resolution.
    fn build_envelope(
        &self,
        log: &EventLog,
        item: &SyncQueueItem,
    ) -> Result<Option<SyncEnvelope>, QueueError> {
        let event = match log.get(&item.payload_ref) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(None),
            Err(StorageError::Corruption { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let event = match (&event, item.link_override) {
            (DomainEvent::Delivery(delivery), Some(version)) => {
                // The fact is immutable in the log; only the wire copy is
                // re-linked against the current server version
                let mut relinked = delivery.clone();
                relinked.route_version = version;
                DomainEvent::Delivery(relinked)
            }
            _ => event,
        };

        let bytes = serde_json::to_vec(&event)?;
        Ok(Some(SyncEnvelope {
            item_id: item.item_id,
            priority: item.priority,
            checksum: payload_checksum(&bytes),
            event,
        }))
    }

    // ------------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------------

    /// Mark a prepared batch's items as in flight.
    pub fn mark_in_flight(&self, keys: &[Vec<u8>]) -> Result<(), QueueError> {
        for key in keys {
            self.update_item(key, |item| item.state = SyncItemState::InFlight)?;
        }
        self.db.flush()?;
        Ok(())
    }

    /// Remove acknowledged items. Unknown ids are ignored — duplicate acks
    /// must not fail (idempotent completion).
    pub fn acknowledge(&self, item_ids: &[Uuid]) -> Result<usize, QueueError> {
        let wanted: HashSet<Uuid> = item_ids.iter().copied().collect();
        let mut removed = 0usize;
        for entry in self.active.iter() {
            let (key, value) = entry?;
            if let Ok(item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                if wanted.contains(&item.item_id) {
                    self.active.remove(&key)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.db.flush()?;
            debug!(removed, "Items acknowledged and removed");
        }
        Ok(removed)
    }

    /// Return in-flight items to Pending with backoff applied.
    ///
    /// Called exactly once per failure (including timeouts), so the retry
    /// counter increments exactly once.
    pub fn release(&self, keys: &[Vec<u8>], now: DateTime<Utc>) -> Result<(), QueueError> {
        for key in keys {
            self.update_item(key, |item| {
                item.state = SyncItemState::Pending;
                item.attempt_count = item.attempt_count.saturating_add(1);
                item.next_retry_at = Some(now + backoff_delay(item.attempt_count));
            })?;
        }
        self.db.flush()?;
        Ok(())
    }

    /// Reset retry state to the initial interval for the whole queue,
    /// called after any successful transmission for this driver's queue.
    pub fn reset_backoff(&self) -> Result<(), QueueError> {
        for entry in self.active.iter() {
            let (key, value) = entry?;
            if let Ok(mut item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                if item.next_retry_at.is_some() || item.attempt_count > 0 {
                    item.next_retry_at = None;
                    item.attempt_count = 0;
                    self.active.insert(&key, serde_json::to_vec(&item)?)?;
                }
            }
        }
        Ok(())
    }

    /// Permanent rejection: move to the rejected tree with the error
    /// attached. Terminal and surfaced — never silently dropped.
    pub fn reject(&self, item_id: Uuid, error: &str) -> Result<(), QueueError> {
        let Some((key, item)) = self.find_active(item_id)? else {
            return Err(QueueError::UnknownItem(item_id));
        };
        self.reject_key(&key, &item, error)
    }

    fn reject_key(
        &self,
        key: &[u8],
        item: &SyncQueueItem,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut rejected = item.clone();
        rejected.state = SyncItemState::Rejected;
        let stored = serde_json::json!({ "item": rejected, "error": error });
        self.rejected
            .insert(key, serde_json::to_vec(&stored)?)?;
        self.active.remove(key)?;
        self.db.flush()?;
        warn!(item_id = %item.item_id, error, "Item permanently rejected");
        Ok(())
    }

    /// Hold an item for manual conflict resolution. The active queue keeps
    /// draining around it.
    pub fn hold_conflicted(&self, item_id: Uuid) -> Result<(), QueueError> {
        let Some((key, mut item)) = self.find_active(item_id)? else {
            return Err(QueueError::UnknownItem(item_id));
        };
        item.state = SyncItemState::Conflicted;
        self.conflicted.insert(&key, serde_json::to_vec(&item)?)?;
        self.active.remove(&key)?;
        self.db.flush()?;
        info!(item_id = %item.item_id, "Item held for manual conflict resolution");
        Ok(())
    }

    /// Re-queue an item with its reference re-linked to the current server
    /// version (ServerWins resolution). The occurred-at fact is preserved.
    pub fn requeue_with_override(
        &self,
        item_id: Uuid,
        server_version: u64,
    ) -> Result<(), QueueError> {
        let Some((key, mut item)) = self.find_active(item_id)? else {
            return Err(QueueError::UnknownItem(item_id));
        };
        item.state = SyncItemState::Pending;
        item.link_override = Some(server_version);
        item.next_retry_at = None;
        self.active.insert(&key, serde_json::to_vec(&item)?)?;
        self.db.flush()?;
        debug!(item_id = %item_id, server_version, "Item re-linked and re-queued");
        Ok(())
    }

    /// Recovery on startup/resume: anything left in flight by an
    /// interruption returns to Pending without a retry increment (the
    /// outcome was unknown, not a failure).
    pub fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut recovered = 0usize;
        for entry in self.active.iter() {
            let (key, value) = entry?;
            if let Ok(mut item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                if item.state == SyncItemState::InFlight {
                    item.state = SyncItemState::Pending;
                    self.active.insert(&key, serde_json::to_vec(&item)?)?;
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            self.db.flush()?;
            info!(recovered, "In-flight items recovered to pending");
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------------
    // Conflict records
    // ------------------------------------------------------------------------

    /// Persist a conflict record for audit.
    pub fn store_conflict_record(&self, record: &ConflictRecord) -> Result<(), QueueError> {
        self.conflict_records
            .insert(record.item_id.as_bytes(), serde_json::to_vec(record)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// All persisted conflict records.
    pub fn conflict_records(&self) -> Result<Vec<ConflictRecord>, QueueError> {
        let mut records = Vec::new();
        for entry in self.conflict_records.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    /// Items currently held for manual resolution.
    pub fn conflicted_items(&self) -> Result<Vec<SyncQueueItem>, QueueError> {
        let mut items = Vec::new();
        for entry in self.conflicted.iter() {
            let (_, value) = entry?;
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Payload refs of every unacknowledged item (active + conflicted).
    /// Compaction must never archive these.
    pub fn pinned_refs(&self) -> Result<HashSet<Vec<u8>>, QueueError> {
        let mut refs = HashSet::new();
        for tree in [&self.active, &self.conflicted] {
            for entry in tree.iter() {
                let (_, value) = entry?;
                if let Ok(item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                    refs.insert(item.payload_ref.0);
                }
            }
        }
        Ok(refs)
    }

    /// Depth counts per class plus side-tree sizes.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats {
            conflicted: self.conflicted.len(),
            rejected: self.rejected.len(),
            ..QueueStats::default()
        };
        for entry in self.active.iter() {
            let (_, value) = entry?;
            if let Ok(item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                *stats.pending.entry(item.priority).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Look up an item by id across the active and conflicted trees.
    pub fn find_item(&self, item_id: Uuid) -> Result<Option<SyncQueueItem>, QueueError> {
        if let Some((_, item)) = self.find_active(item_id)? {
            return Ok(Some(item));
        }
        for entry in self.conflicted.iter() {
            let (_, value) = entry?;
            if let Ok(item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                if item.item_id == item_id {
                    return Ok(Some(item));
                }
            }
        }
        Ok(None)
    }

    fn find_active(&self, item_id: Uuid) -> Result<Option<(Vec<u8>, SyncQueueItem)>, QueueError> {
        for entry in self.active.iter() {
            let (key, value) = entry?;
            if let Ok(item) = serde_json::from_slice::<SyncQueueItem>(&value) {
                if item.item_id == item_id {
                    return Ok(Some((key.to_vec(), item)));
                }
            }
        }
        Ok(None)
    }

    fn update_item(
        &self,
        key: &[u8],
        mutate: impl FnOnce(&mut SyncQueueItem),
    ) -> Result<(), QueueError> {
        if let Some(value) = self.active.get(key)? {
            let mut item: SyncQueueItem = serde_json::from_slice(&value)?;
            mutate(&mut item);
            self.active.insert(key, serde_json::to_vec(&item)?)?;
        }
        Ok(())
    }
}

/// Exponential backoff with jitter, capped at the end of the schedule
/// (30 s, 1 m, 5 m, 15 m, 1 h, then hourly).
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let idx = (attempt.max(1) as usize - 1).min(RETRY_BACKOFF_SECS.len() - 1);
    let base = RETRY_BACKOFF_SECS[idx];
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_SECS);
    Duration::seconds((base + jitter) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DeliveryEvent, DutyStatus, DutyStatusEvent, IncidentEvent, TransitionCause,
    };
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
    }

    fn budgets() -> BatchBudgets {
        BatchBudgets {
            normal_bytes: 64 * 1024,
            critical_bytes: 8 * 1024,
        }
    }

    fn delivery(at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::Delivery(DeliveryEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            occurred_at: at,
            route_id: "R1".to_string(),
            stop_id: "S1".to_string(),
            route_version: 3,
            signature_ref: None,
        })
    }

    fn incident(at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::Incident(IncidentEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            occurred_at: at,
            description: "blown tire".to_string(),
            gps: None,
        })
    }

    fn duty(at: DateTime<Utc>) -> DomainEvent {
        DomainEvent::DutyStatus(DutyStatusEvent {
            event_id: Uuid::new_v4(),
            driver_id: "D1".to_string(),
            vehicle_id: "V1".to_string(),
            status: DutyStatus::Driving,
            cause: TransitionCause::AutoSwitch,
            occurred_at: at,
            gps: None,
            source_confidence: 1.0,
            yard_move: false,
            reason: None,
            corrects: None,
        })
    }

    /// Open a log + queue pair and append/enqueue the given events.
    fn setup(events: &[DomainEvent]) -> (tempfile::TempDir, EventLog, SyncQueue) {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();
        let queue = SyncQueue::open(tmp.path()).unwrap();
        for event in events {
            let key = log.append(event).unwrap();
            queue.enqueue_event(event, key).unwrap();
        }
        (tmp, log, queue)
    }

    #[test]
    fn test_critical_batch_isolated_from_lower_classes() {
        // Scenario: offline accumulation of 1 Critical + 3 Normal; the
        // Critical item must go out alone, before any delivery
        let events = vec![
            delivery(t0()),
            delivery(t0() + Duration::minutes(10)),
            incident(t0() + Duration::minutes(20)),
            delivery(t0() + Duration::minutes(30)),
        ];
        let (_tmp, log, queue) = setup(&events);

        let first = queue
            .next_batch(&log, t0() + Duration::hours(4), budgets(), "ELD-1")
            .unwrap()
            .unwrap();
        assert_eq!(first.batch.priority, Priority::Critical);
        assert_eq!(first.batch.items.len(), 1);
        assert!(matches!(
            first.batch.items[0].event,
            DomainEvent::Incident(_)
        ));

        queue
            .acknowledge(&[first.batch.items[0].item_id])
            .unwrap();

        let second = queue
            .next_batch(&log, t0() + Duration::hours(4), budgets(), "ELD-1")
            .unwrap()
            .unwrap();
        assert_eq!(second.batch.priority, Priority::Normal);
        assert_eq!(second.batch.items.len(), 3);
    }

    #[test]
    fn test_fifo_within_class() {
        let events = vec![
            delivery(t0() + Duration::minutes(30)),
            delivery(t0()),
            delivery(t0() + Duration::minutes(10)),
        ];
        let (_tmp, log, queue) = setup(&events);

        let batch = queue
            .next_batch(&log, t0() + Duration::hours(1), budgets(), "ELD-1")
            .unwrap()
            .unwrap();
        let times: Vec<_> = batch
            .batch
            .items
            .iter()
            .map(|e| e.event.occurred_at())
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_duty_outranks_delivery() {
        let events = vec![delivery(t0()), duty(t0() + Duration::minutes(5))];
        let (_tmp, log, queue) = setup(&events);

        let batch = queue
            .next_batch(&log, t0() + Duration::hours(1), budgets(), "ELD-1")
            .unwrap()
            .unwrap();
        assert_eq!(batch.batch.priority, Priority::High);
    }

    #[test]
    fn test_enqueue_idempotent() {
        let event = delivery(t0());
        let (_tmp, log, queue) = setup(&[event.clone()]);
        let key = log.append(&event).unwrap();
        queue.enqueue_event(&event, key).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending.get(&Priority::Normal), Some(&1));
    }

    #[test]
    fn test_release_applies_backoff_once() {
        let (_tmp, log, queue) = setup(&[delivery(t0())]);
        let now = t0() + Duration::hours(1);

        let batch = queue.next_batch(&log, now, budgets(), "ELD-1").unwrap().unwrap();
        queue.mark_in_flight(&batch.keys).unwrap();
        queue.release(&batch.keys, now).unwrap();

        // Not due again until the backoff elapses
        assert!(queue.next_batch(&log, now, budgets(), "ELD-1").unwrap().is_none());
        let later = now + Duration::seconds(60);
        let retried = queue.next_batch(&log, later, budgets(), "ELD-1").unwrap().unwrap();
        assert_eq!(retried.batch.items.len(), 1);
    }

    #[test]
    fn test_rejected_item_is_terminal_and_kept() {
        let event = delivery(t0());
        let (_tmp, log, queue) = setup(&[event.clone()]);

        queue.reject(event.event_id(), "schema validation failed").unwrap();

        assert!(queue
            .next_batch(&log, t0() + Duration::hours(1), budgets(), "ELD-1")
            .unwrap()
            .is_none());
        assert_eq!(queue.stats().unwrap().rejected, 1);
    }

    #[test]
    fn test_conflicted_item_does_not_block_queue() {
        let held = delivery(t0());
        let events = vec![held.clone(), delivery(t0() + Duration::minutes(1))];
        let (_tmp, log, queue) = setup(&events);

        queue.hold_conflicted(held.event_id()).unwrap();

        let batch = queue
            .next_batch(&log, t0() + Duration::hours(1), budgets(), "ELD-1")
            .unwrap()
            .unwrap();
        assert_eq!(batch.batch.items.len(), 1);
        assert_ne!(batch.batch.items[0].item_id, held.event_id());
        assert_eq!(queue.conflicted_items().unwrap().len(), 1);
    }

    #[test]
    fn test_relink_override_rewrites_wire_copy_only() {
        let event = delivery(t0());
        let (_tmp, log, queue) = setup(&[event.clone()]);

        queue.requeue_with_override(event.event_id(), 9).unwrap();

        let batch = queue
            .next_batch(&log, t0() + Duration::hours(1), budgets(), "ELD-1")
            .unwrap()
            .unwrap();
        match &batch.batch.items[0].event {
            DomainEvent::Delivery(d) => assert_eq!(d.route_version, 9),
            other => panic!("unexpected payload: {:?}", other),
        }

        // The log still holds the original fact
        match &log.scan_driver("D1").unwrap()[0] {
            DomainEvent::Delivery(d) => assert_eq!(d.route_version, 3),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_pinned_refs_cover_unacknowledged() {
        let events = vec![delivery(t0()), delivery(t0() + Duration::minutes(1))];
        let (_tmp, _log, queue) = setup(&events);

        assert_eq!(queue.pinned_refs().unwrap().len(), 2);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let event = delivery(t0());
        {
            let log = EventLog::open(tmp.path()).unwrap();
            let queue = SyncQueue::open(tmp.path()).unwrap();
            let key = log.append(&event).unwrap();
            queue.enqueue_event(&event, key).unwrap();
            let batch = queue
                .next_batch(&log, t0(), budgets(), "ELD-1")
                .unwrap()
                .unwrap();
            queue.mark_in_flight(&batch.keys).unwrap();
        }
        {
            let log = EventLog::open(tmp.path()).unwrap();
            let queue = SyncQueue::open(tmp.path()).unwrap();
            assert_eq!(queue.recover_in_flight().unwrap(), 1);
            let batch = queue
                .next_batch(&log, t0(), budgets(), "ELD-1")
                .unwrap()
                .unwrap();
            // Recovery does not increment the retry counter
            assert_eq!(batch.batch.items.len(), 1);
            let stats = queue.stats().unwrap();
            assert_eq!(stats.pending.get(&Priority::Normal), Some(&1));
        }
    }
}
