//! Conflict Resolver — reconciles queued facts against server state.
//!
//! Invoked only for items whose payload references a server-side mutable
//! entity (routes, stop lists, assignments). The default policy: the server
//! wins for reference data, but the locally captured fact is never lost —
//! it is re-linked against the current server version and resent. Anything
//! the policy cannot resolve automatically is held for manual resolution
//! without blocking the rest of the queue.

use super::queue::{QueueError, SyncQueue};
use super::types::{ConflictKind, ConflictNotice, ConflictRecord, ConflictResolution};
use crate::notify::{Advisory, AdvisoryKind, AdvisorySeverity, NotificationSink};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Applies the resolution policy and keeps the audit trail.
pub struct ConflictResolver {
    queue: SyncQueue,
    sink: Arc<dyn NotificationSink>,
    driver_id: String,
}

impl ConflictResolver {
    pub fn new(queue: SyncQueue, sink: Arc<dyn NotificationSink>, driver_id: &str) -> Self {
        Self {
            queue,
            sink,
            driver_id: driver_id.to_string(),
        }
    }

    /// Resolve one server-reported conflict.
    ///
    /// Every detected conflict persists a [`ConflictRecord`], whichever
    /// way it resolves.
    pub fn resolve(&self, notice: &ConflictNotice) -> Result<ConflictResolution, QueueError> {
        let local_version = self
            .queue
            .find_item(notice.item_id)?
            .and_then(|item| item.local_version);

        let (resolution, server_version) = match notice.kind {
            ConflictKind::VersionMismatch { server_version } => {
                // Server wins for reference data; the fact is re-linked
                // against the current version and resent
                self.queue
                    .requeue_with_override(notice.item_id, server_version)?;
                info!(
                    item_id = %notice.item_id,
                    server_version,
                    "Conflict resolved: server wins, fact re-linked"
                );
                (ConflictResolution::ServerWins, Some(server_version))
            }
            ConflictKind::ReferentDeleted => {
                // Cannot resolve automatically: hold for manual resolution,
                // preserving the completion fact
                self.queue.hold_conflicted(notice.item_id)?;
                warn!(
                    item_id = %notice.item_id,
                    "Referenced entity deleted server-side — held for manual resolution"
                );
                self.sink.notify(Advisory {
                    driver_id: self.driver_id.clone(),
                    severity: AdvisorySeverity::Warning,
                    kind: AdvisoryKind::ConflictHeld {
                        item_id: notice.item_id,
                    },
                    message: "A captured record conflicts with dispatch changes and needs review"
                        .to_string(),
                    at: Utc::now(),
                });
                (ConflictResolution::PendingManual, None)
            }
        };

        self.queue.store_conflict_record(&ConflictRecord {
            item_id: notice.item_id,
            driver_id: self.driver_id.clone(),
            local_version,
            server_version,
            resolution,
            recorded_at: Utc::now(),
        })?;

        Ok(resolution)
    }
}
