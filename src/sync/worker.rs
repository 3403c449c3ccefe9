//! Sync worker — background task that drains the queue to the backend.
//!
//! Runs decoupled from the session writer: it wakes on new-entry
//! notification or on the connectivity monitor's online transition, drains
//! by strict priority, and suspends while awaiting network I/O or backoff
//! timers. Cancellation is honored only at batch boundaries so a lifecycle
//! suspension can never corrupt an in-flight transmission; on resume the
//! queue restarts from the last acknowledged checkpoint.

use super::conflict::ConflictResolver;
use super::queue::{BatchBudgets, PreparedBatch, SyncQueue};
use super::transport::SyncTransport;
use crate::config::defaults::{
    INTEGRITY_ESCALATION_THRESHOLD, RETRY_BACKOFF_SECS, RETRY_JITTER_SECS, SYNC_IDLE_POLL_SECS,
};
use crate::connectivity::LinkState;
use crate::notify::{Advisory, AdvisoryKind, AdvisorySeverity, NotificationSink};
use crate::storage::EventLog;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Static configuration for one worker.
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    pub device_id: String,
    pub driver_id: String,
    pub budgets: BatchBudgets,
    pub request_timeout: Duration,
    pub delayed_warning_ceiling: u32,
}

/// Background sync worker for one device.
pub struct SyncWorker {
    queue: SyncQueue,
    log: EventLog,
    transport: Arc<dyn SyncTransport>,
    resolver: ConflictResolver,
    sink: Arc<dyn NotificationSink>,
    link: watch::Receiver<LinkState>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    config: SyncWorkerConfig,
    consecutive_failures: u32,
    /// Checksum-mismatch count per item, for escalation of repeats
    integrity_failures: HashMap<Uuid, u32>,
}

impl SyncWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: SyncQueue,
        log: EventLog,
        transport: Arc<dyn SyncTransport>,
        sink: Arc<dyn NotificationSink>,
        link: watch::Receiver<LinkState>,
        wake: Arc<Notify>,
        cancel: CancellationToken,
        config: SyncWorkerConfig,
    ) -> Self {
        let resolver = ConflictResolver::new(queue.clone(), sink.clone(), &config.driver_id);
        Self {
            queue,
            log,
            transport,
            resolver,
            sink,
            link,
            wake,
            cancel,
            config,
            consecutive_failures: 0,
            integrity_failures: HashMap::new(),
        }
    }

    /// Run until cancelled. Cancellation is checked between batches only.
    pub async fn run(mut self) {
        match self.queue.recover_in_flight() {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "Resumed from interrupted transmission"),
            Err(e) => warn!(error = %e, "In-flight recovery failed"),
        }

        let mut just_drained = false;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.link.borrow().is_online() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = self.link.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let next = self.queue.next_batch(
                &self.log,
                Utc::now(),
                self.config.budgets,
                &self.config.device_id,
            );
            match next {
                Ok(Some(prepared)) => {
                    self.transmit(prepared).await;
                    just_drained = true;

                    if self.consecutive_failures > 0 {
                        let delay = worker_backoff(self.consecutive_failures);
                        debug!(delay_secs = delay.as_secs(), "Backing off after failure");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Ok(None) => {
                    if just_drained {
                        just_drained = false;
                        self.poll_conflicts().await;
                    }
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        changed = self.link.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_secs(SYNC_IDLE_POLL_SECS)) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to assemble batch");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(SYNC_IDLE_POLL_SECS)) => {}
                    }
                }
            }
        }
        info!("Sync worker stopped at batch boundary");
    }

    /// Transmit one batch and apply the outcome. Never interrupted mid-batch.
    async fn transmit(&mut self, prepared: PreparedBatch) {
        if let Err(e) = self.queue.mark_in_flight(&prepared.keys) {
            warn!(error = %e, "Could not mark batch in flight");
            return;
        }
        info!(
            batch_id = %prepared.batch.batch_id,
            priority = %prepared.batch.priority,
            items = prepared.batch.items.len(),
            "Transmitting batch"
        );

        let send = self.transport.send_batch(&prepared.batch);
        match tokio::time::timeout(self.config.request_timeout, send).await {
            // Timed out: back to Pending, retry counter incremented exactly
            // once (release is the only increment on this path)
            Err(_) => {
                warn!(
                    batch_id = %prepared.batch.batch_id,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Batch transmission timed out"
                );
                if let Err(e) = self.queue.release(&prepared.keys, Utc::now()) {
                    warn!(error = %e, "Failed to release timed-out batch");
                }
                self.note_failure();
            }
            Ok(Err(e)) if e.is_permanent() => {
                // Validation failure: terminal, surfaced, never retried
                for envelope in &prepared.batch.items {
                    if let Err(qe) = self.queue.reject(envelope.item_id, &e.to_string()) {
                        warn!(error = %qe, "Failed to record rejection");
                    }
                    self.sink.notify(Advisory {
                        driver_id: self.config.driver_id.clone(),
                        severity: AdvisorySeverity::Warning,
                        kind: AdvisoryKind::SyncRejected {
                            item_id: envelope.item_id,
                            error: e.to_string(),
                        },
                        message: "The backend rejected a captured record".to_string(),
                        at: Utc::now(),
                    });
                }
                // The server answered; connectivity is fine
                self.consecutive_failures = 0;
            }
            Ok(Err(e)) => {
                warn!(batch_id = %prepared.batch.batch_id, error = %e, "Batch transmission failed");
                if let Err(qe) = self.queue.release(&prepared.keys, Utc::now()) {
                    warn!(error = %qe, "Failed to release failed batch");
                }
                self.note_failure();
            }
            Ok(Ok(ack)) => {
                if ack.checksum != prepared.batch.checksum {
                    self.handle_integrity_failure(&prepared, &ack.checksum);
                    return;
                }

                self.consecutive_failures = 0;
                if let Err(e) = self.queue.reset_backoff() {
                    warn!(error = %e, "Failed to reset queue backoff");
                }
                for envelope in &prepared.batch.items {
                    self.integrity_failures.remove(&envelope.item_id);
                }

                match self.queue.acknowledge(&ack.accepted) {
                    Ok(removed) => {
                        info!(
                            batch_id = %prepared.batch.batch_id,
                            acknowledged = removed,
                            "Batch acknowledged"
                        );
                    }
                    Err(e) => warn!(error = %e, "Failed to remove acknowledged items"),
                }

                for rejection in &ack.rejected {
                    if let Err(e) = self.queue.reject(rejection.item_id, &rejection.error) {
                        warn!(error = %e, "Failed to record item rejection");
                    }
                    self.sink.notify(Advisory {
                        driver_id: self.config.driver_id.clone(),
                        severity: AdvisorySeverity::Warning,
                        kind: AdvisoryKind::SyncRejected {
                            item_id: rejection.item_id,
                            error: rejection.error.clone(),
                        },
                        message: "The backend rejected a captured record".to_string(),
                        at: Utc::now(),
                    });
                }

                for conflict in &ack.conflicts {
                    if let Err(e) = self.resolver.resolve(conflict) {
                        warn!(item_id = %conflict.item_id, error = %e, "Conflict resolution failed");
                    }
                }
            }
        }
    }

    /// Checksum mismatch on an otherwise successful response: retried,
    /// logged for audit, escalated when the same items keep failing.
    fn handle_integrity_failure(&mut self, prepared: &PreparedBatch, ack_checksum: &str) {
        let error = crate::sync::transport::TransportError::Integrity {
            expected: prepared.batch.checksum.clone(),
            got: ack_checksum.to_string(),
        };
        warn!(
            batch_id = %prepared.batch.batch_id,
            error = %error,
            "Integrity failure — batch will be retried"
        );
        if let Err(e) = self.queue.release(&prepared.keys, Utc::now()) {
            warn!(error = %e, "Failed to release batch after integrity failure");
        }
        for envelope in &prepared.batch.items {
            let count = self
                .integrity_failures
                .entry(envelope.item_id)
                .and_modify(|c| *c += 1)
                .or_insert(1);
            if *count >= INTEGRITY_ESCALATION_THRESHOLD {
                self.sink.notify(Advisory {
                    driver_id: self.config.driver_id.clone(),
                    severity: AdvisorySeverity::Critical,
                    kind: AdvisoryKind::SyncRejected {
                        item_id: envelope.item_id,
                        error: "repeated checksum mismatch".to_string(),
                    },
                    message: format!(
                        "Checksum mismatch repeated {} times for one record — possible transport or backend fault",
                        count
                    ),
                    at: Utc::now(),
                });
            }
        }
        self.note_failure();
    }

    fn note_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures == self.config.delayed_warning_ceiling {
            let pending = self
                .queue
                .stats()
                .map(|s| s.pending.values().sum())
                .unwrap_or(0);
            self.sink.notify(Advisory {
                driver_id: self.config.driver_id.clone(),
                severity: AdvisorySeverity::Warning,
                kind: AdvisoryKind::SyncDelayed { pending },
                message: format!("Sync delayed: {} records waiting for upload", pending),
                at: Utc::now(),
            });
        }
    }

    /// Pull dispatch-raised conflicts once the queue is drained.
    async fn poll_conflicts(&mut self) {
        let poll = self.transport.poll_conflicts(&self.config.driver_id);
        match tokio::time::timeout(self.config.request_timeout, poll).await {
            Ok(Ok(notices)) => {
                for notice in &notices {
                    if let Err(e) = self.resolver.resolve(notice) {
                        warn!(item_id = %notice.item_id, error = %e, "Conflict resolution failed");
                    }
                }
            }
            Ok(Err(e)) => debug!(error = %e, "Conflict poll failed"),
            Err(_) => debug!("Conflict poll timed out"),
        }
    }
}

/// Worker-level pause after a failed cycle, on the same capped schedule as
/// item backoff, with jitter.
fn worker_backoff(consecutive_failures: u32) -> Duration {
    use rand::Rng;
    let idx = (consecutive_failures.max(1) as usize - 1).min(RETRY_BACKOFF_SECS.len() - 1);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_SECS);
    Duration::from_secs(RETRY_BACKOFF_SECS[idx] + jitter)
}
