//! Sled-backed append-only event log with quarantine and archival.

use crate::types::{DomainEvent, ShiftSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type for event log operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("archive I/O error: {0}")]
    ArchiveIo(#[from] std::io::Error),
    /// Fatal for the affected record only — the entry has been quarantined
    /// and the driver-day flagged incomplete. The log itself stays live.
    #[error("storage corruption at key {key_hex}: entry quarantined")]
    Corruption { key_hex: String },
}

// ============================================================================
// Key Encoding
// ============================================================================

/// Composite key into the event tree: `driver_id \0 occurred_at_ms event_id`.
///
/// Big-endian millisecond timestamps make lexicographic order chronological;
/// the UUID tiebreaks events sharing a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey(pub Vec<u8>);

impl EventKey {
    pub fn encode(driver_id: &str, occurred_at: DateTime<Utc>, event_id: Uuid) -> Self {
        let mut key = Vec::with_capacity(driver_id.len() + 1 + 8 + 16);
        key.extend_from_slice(driver_id.as_bytes());
        key.push(0);
        key.extend_from_slice(&(occurred_at.timestamp_millis().max(0) as u64).to_be_bytes());
        key.extend_from_slice(event_id.as_bytes());
        Self(key)
    }

    pub fn for_event(event: &DomainEvent) -> Self {
        Self::encode(event.driver_id(), event.occurred_at(), event.event_id())
    }

    fn driver_prefix(driver_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(driver_id.len() + 1);
        prefix.extend_from_slice(driver_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn time_bound(driver_id: &str, at: DateTime<Utc>) -> Vec<u8> {
        let mut bound = Self::driver_prefix(driver_id);
        bound.extend_from_slice(&(at.timestamp_millis().max(0) as u64).to_be_bytes());
        bound
    }

    /// Millisecond timestamp embedded in the key, if well-formed.
    fn timestamp_millis(&self) -> Option<u64> {
        let sep = self.0.iter().position(|&b| b == 0)?;
        let ts_bytes = self.0.get(sep + 1..sep + 9)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(ts_bytes);
        Some(u64::from_be_bytes(buf))
    }

    fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

// ============================================================================
// Event Log
// ============================================================================

/// Durable event log for one device
///
/// Cloneable handle over a shared sled database. The session writer appends;
/// the HOS calculator and sync queue manager read committed entries only.
#[derive(Clone)]
pub struct EventLog {
    db: Arc<sled::Db>,
    events: sled::Tree,
    quarantine: sled::Tree,
    /// Driver-days whose history is incomplete (quarantined entries)
    periods: sled::Tree,
    shifts: sled::Tree,
    archive_dir: PathBuf,
}

impl EventLog {
    /// Open or create the event log under the given data directory.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref();
        let db = sled::open(data_dir.join("event_log"))?;
        let events = db.open_tree("events")?;
        let quarantine = db.open_tree("quarantine")?;
        let periods = db.open_tree("incomplete_periods")?;
        let shifts = db.open_tree("shifts")?;
        let archive_dir = data_dir.join("archive");
        std::fs::create_dir_all(&archive_dir)?;

        info!(entries = events.len(), "Event log opened");
        Ok(Self {
            db: Arc::new(db),
            events,
            quarantine,
            periods,
            shifts,
            archive_dir,
        })
    }

    /// Append a domain event and flush to stable storage.
    ///
    /// The event is not handed to any reader until this returns — that is
    /// the write-ahead durability guarantee the rest of the engine relies on.
    /// Duplicate appends of the same event are idempotent.
    pub fn append(&self, event: &DomainEvent) -> Result<EventKey, StorageError> {
        let key = EventKey::for_event(event);
        if self.events.contains_key(&key.0)? {
            debug!(event_id = %event.event_id(), "Event already persisted, skipping");
            return Ok(key);
        }
        let value = serde_json::to_vec(event)?;
        self.events.insert(&key.0, value)?;
        self.db.flush()?;
        debug!(
            event_id = %event.event_id(),
            kind = event.kind_name(),
            driver = event.driver_id(),
            "Event appended"
        );
        Ok(key)
    }

    /// Fetch one event by key. A corrupt value is quarantined and reported
    /// as [`StorageError::Corruption`].
    pub fn get(&self, key: &EventKey) -> Result<Option<DomainEvent>, StorageError> {
        match self.events.get(&key.0)? {
            None => Ok(None),
            Some(value) => match serde_json::from_slice(&value) {
                Ok(event) => Ok(Some(event)),
                Err(_) => {
                    self.quarantine_entry(key, &value)?;
                    Err(StorageError::Corruption { key_hex: key.hex() })
                }
            },
        }
    }

    /// All committed events for a driver in `(occurred_at, event_id)` order.
    ///
    /// Corrupt entries are quarantined and skipped — a damaged record never
    /// halts a replay, it leaves an audit flag instead.
    pub fn scan_driver(&self, driver_id: &str) -> Result<Vec<DomainEvent>, StorageError> {
        self.collect(self.events.scan_prefix(EventKey::driver_prefix(driver_id)))
    }

    /// Events for a driver within `[from, to)`.
    pub fn scan_range(
        &self,
        driver_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, StorageError> {
        let lo = EventKey::time_bound(driver_id, from);
        let hi = EventKey::time_bound(driver_id, to);
        self.collect(self.events.range(lo..hi))
    }

    fn collect(
        &self,
        iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    ) -> Result<Vec<DomainEvent>, StorageError> {
        let mut events = Vec::new();
        for item in iter {
            let (key, value) = item?;
            match serde_json::from_slice::<DomainEvent>(&value) {
                Ok(event) => events.push(event),
                Err(e) => {
                    let key = EventKey(key.to_vec());
                    warn!(key = %key.hex(), error = %e, "Corrupted log entry — quarantining");
                    self.quarantine_entry(&key, &value)?;
                }
            }
        }
        Ok(events)
    }

    /// Move a corrupt entry out of the live tree and flag the driver-day.
    fn quarantine_entry(&self, key: &EventKey, raw: &[u8]) -> Result<(), StorageError> {
        self.quarantine.insert(&key.0, raw)?;
        self.events.remove(&key.0)?;

        // Flag the driver-day as incomplete for audit
        if let Some((driver, day_key)) = Self::period_key(key) {
            self.periods.insert(&day_key, vec![1])?;
            warn!(
                driver = driver,
                "Compliance record flagged incomplete for quarantined entry"
            );
        }
        self.db.flush()?;
        Ok(())
    }

    fn period_key(key: &EventKey) -> Option<(String, Vec<u8>)> {
        let sep = key.0.iter().position(|&b| b == 0)?;
        let driver = String::from_utf8(key.0[..sep].to_vec()).ok()?;
        let millis = key.timestamp_millis()?;
        let day = millis / 86_400_000;
        let mut day_key = key.0[..=sep].to_vec();
        day_key.extend_from_slice(&day.to_be_bytes());
        Some((driver, day_key))
    }

    /// UTC day indices (days since epoch) with incomplete history for a driver.
    pub fn incomplete_periods(&self, driver_id: &str) -> Result<Vec<u64>, StorageError> {
        let prefix = EventKey::driver_prefix(driver_id);
        let mut days = Vec::new();
        for item in self.periods.scan_prefix(&prefix) {
            let (key, _) = item?;
            if let Some(day_bytes) = key.get(prefix.len()..prefix.len() + 8) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(day_bytes);
                days.push(u64::from_be_bytes(buf));
            }
        }
        Ok(days)
    }

    /// Number of quarantined entries.
    pub fn quarantined_count(&self) -> usize {
        self.quarantine.len()
    }

    // ------------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------------

    /// Archive entries older than `cutoff`, skipping any key in `pinned`.
    ///
    /// Pinned keys belong to unacknowledged sync items — archival never
    /// removes an entry the queue still references. Archived entries are
    /// written as a zstd-compressed JSON-lines file named by sweep time,
    /// then removed from the live tree.
    pub fn compact(
        &self,
        cutoff: DateTime<Utc>,
        pinned: &HashSet<Vec<u8>>,
    ) -> Result<CompactionStats, StorageError> {
        let cutoff_ms = cutoff.timestamp_millis().max(0) as u64;
        let mut candidates: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut pinned_skipped = 0usize;

        for item in self.events.iter() {
            let (key, value) = item?;
            let event_key = EventKey(key.to_vec());
            let Some(ts) = event_key.timestamp_millis() else {
                continue;
            };
            if ts >= cutoff_ms {
                continue;
            }
            if pinned.contains(&event_key.0) {
                pinned_skipped += 1;
                continue;
            }
            candidates.push((event_key.0, value.to_vec()));
        }

        if candidates.is_empty() {
            return Ok(CompactionStats {
                archived: 0,
                pinned_skipped,
            });
        }

        // One archive file per sweep, JSON-lines compressed with zstd
        let mut lines = Vec::new();
        for (_, value) in &candidates {
            lines.extend_from_slice(value);
            lines.push(b'\n');
        }
        let compressed = zstd::encode_all(lines.as_slice(), 3)
            .map_err(StorageError::ArchiveIo)?;
        let file_name = format!("events-{}.jsonl.zst", Utc::now().timestamp());
        std::fs::write(self.archive_dir.join(&file_name), compressed)?;

        for (key, _) in &candidates {
            self.events.remove(key)?;
        }
        self.db.flush()?;

        info!(
            archived = candidates.len(),
            pinned_skipped,
            file = %file_name,
            "Compaction sweep complete"
        );
        Ok(CompactionStats {
            archived: candidates.len(),
            pinned_skipped,
        })
    }

    // ------------------------------------------------------------------------
    // Shift sessions (reporting rollups only)
    // ------------------------------------------------------------------------

    /// Persist a shift session (on clock-out, or updated mid-shift).
    pub fn store_shift(&self, shift: &ShiftSession) -> Result<(), StorageError> {
        let mut key = EventKey::driver_prefix(&shift.driver_id);
        key.extend_from_slice(&(shift.clock_in.timestamp_millis().max(0) as u64).to_be_bytes());
        self.shifts.insert(key, serde_json::to_vec(shift)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// All stored shift sessions for a driver, oldest first.
    pub fn shifts_for(&self, driver_id: &str) -> Result<Vec<ShiftSession>, StorageError> {
        let mut shifts = Vec::new();
        for item in self.shifts.scan_prefix(EventKey::driver_prefix(driver_id)) {
            let (_, value) = item?;
            shifts.push(serde_json::from_slice(&value)?);
        }
        Ok(shifts)
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    /// Storage statistics for diagnostics and queue-depth reporting.
    pub fn stats(&self) -> LogStats {
        let (oldest, newest) = {
            let first = self
                .events
                .iter()
                .next()
                .and_then(|r| r.ok())
                .and_then(|(k, _)| EventKey(k.to_vec()).timestamp_millis());
            let last = self
                .events
                .iter()
                .next_back()
                .and_then(|r| r.ok())
                .and_then(|(k, _)| EventKey(k.to_vec()).timestamp_millis());
            (first, last)
        };
        LogStats {
            event_count: self.events.len(),
            quarantined_count: self.quarantine.len(),
            size_bytes: self.db.size_on_disk().unwrap_or(0),
            oldest_millis: oldest,
            newest_millis: newest,
        }
    }
}

/// Result of a compaction sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub archived: usize,
    pub pinned_skipped: usize,
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct LogStats {
    pub event_count: usize,
    pub quarantined_count: usize,
    pub size_bytes: u64,
    pub oldest_millis: Option<u64>,
    pub newest_millis: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DutyStatus, DutyStatusEvent, TransitionCause};
    use chrono::{Duration, TimeZone};

    fn duty_event(driver: &str, at: DateTime<Utc>, status: DutyStatus) -> DomainEvent {
        DomainEvent::DutyStatus(DutyStatusEvent {
            event_id: Uuid::new_v4(),
            driver_id: driver.to_string(),
            vehicle_id: "V1".to_string(),
            status,
            cause: TransitionCause::Manual,
            occurred_at: at,
            gps: None,
            source_confidence: 1.0,
            yard_move: false,
            reason: Some("test".to_string()),
            corrects: None,
        })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_append_and_scan_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        // Append out of order; scan must return chronological order
        log.append(&duty_event("D1", t0() + Duration::hours(2), DutyStatus::Driving))
            .unwrap();
        log.append(&duty_event("D1", t0(), DutyStatus::OnDutyNotDriving))
            .unwrap();
        log.append(&duty_event("D1", t0() + Duration::hours(1), DutyStatus::Driving))
            .unwrap();

        let events = log.scan_driver("D1").unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].occurred_at() < events[1].occurred_at());
        assert!(events[1].occurred_at() < events[2].occurred_at());
    }

    #[test]
    fn test_drivers_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        log.append(&duty_event("D1", t0(), DutyStatus::Driving)).unwrap();
        log.append(&duty_event("D2", t0(), DutyStatus::OffDuty)).unwrap();

        assert_eq!(log.scan_driver("D1").unwrap().len(), 1);
        assert_eq!(log.scan_driver("D2").unwrap().len(), 1);
        assert_eq!(log.scan_driver("D3").unwrap().len(), 0);
    }

    #[test]
    fn test_range_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        for h in 0..5 {
            log.append(&duty_event("D1", t0() + Duration::hours(h), DutyStatus::Driving))
                .unwrap();
        }

        let window = log
            .scan_range("D1", t0() + Duration::hours(1), t0() + Duration::hours(3))
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_append_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        let event = duty_event("D1", t0(), DutyStatus::Driving);
        log.append(&event).unwrap();
        log.append(&event).unwrap();
        assert_eq!(log.scan_driver("D1").unwrap().len(), 1);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let event = duty_event("D1", t0(), DutyStatus::Driving);
        {
            let log = EventLog::open(tmp.path()).unwrap();
            log.append(&event).unwrap();
        }
        {
            let log = EventLog::open(tmp.path()).unwrap();
            let events = log.scan_driver("D1").unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_id(), event.event_id());
        }
    }

    #[test]
    fn test_corrupt_entry_quarantined_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        log.append(&duty_event("D1", t0(), DutyStatus::Driving)).unwrap();

        // Corrupt a second entry by writing garbage directly
        let bad_key = EventKey::encode("D1", t0() + Duration::hours(1), Uuid::new_v4());
        log.events.insert(&bad_key.0, b"not json".to_vec()).unwrap();

        let events = log.scan_driver("D1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(log.quarantined_count(), 1);
        assert_eq!(log.incomplete_periods("D1").unwrap().len(), 1);
    }

    #[test]
    fn test_compaction_honors_pins_and_cutoff() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        let old_pinned = duty_event("D1", t0() - Duration::days(400), DutyStatus::Driving);
        let old_free = duty_event("D1", t0() - Duration::days(399), DutyStatus::OffDuty);
        let recent = duty_event("D1", t0(), DutyStatus::Driving);
        let pinned_key = log.append(&old_pinned).unwrap();
        log.append(&old_free).unwrap();
        log.append(&recent).unwrap();

        let mut pinned = HashSet::new();
        pinned.insert(pinned_key.0.clone());

        let stats = log.compact(t0() - Duration::days(180), &pinned).unwrap();
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.pinned_skipped, 1);

        let remaining = log.scan_driver("D1").unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn test_shift_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let log = EventLog::open(tmp.path()).unwrap();

        let mut shift = ShiftSession::start("D1", "V1", t0());
        shift.events_recorded = 7;
        log.store_shift(&shift).unwrap();

        let shifts = log.shifts_for("D1").unwrap();
        assert_eq!(shifts.len(), 1);
        assert_eq!(shifts[0].events_recorded, 7);
    }
}
