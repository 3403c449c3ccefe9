//! Connectivity Monitor — link-state transitions that drive queue activation.
//!
//! Thin and external-facing: the platform layer pushes transitions in;
//! the sync worker subscribes and wakes on the offline → online edge.
//! Connectivity is injected per device context, never a process global.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Coarse bandwidth classification reported by the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BandwidthClass {
    Low,
    Medium,
    High,
}

/// Current link state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkState {
    Offline,
    Online(BandwidthClass),
}

impl LinkState {
    pub fn is_online(&self) -> bool {
        matches!(self, LinkState::Online(_))
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Offline => write!(f, "offline"),
            LinkState::Online(class) => write!(f, "online ({:?})", class),
        }
    }
}

/// Publishes link-state transitions to subscribers.
pub struct ConnectivityMonitor {
    tx: watch::Sender<LinkState>,
}

impl ConnectivityMonitor {
    /// Start in the `Offline` state — the queue only activates once the
    /// platform reports a link.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkState::Offline);
        Self { tx }
    }

    /// Platform callback: report a link-state transition.
    pub fn report(&self, state: LinkState) {
        let previous = *self.tx.borrow();
        if previous != state {
            info!(from = %previous, to = %state, "Connectivity transition");
        }
        let _ = self.tx.send(state);
    }

    /// Subscribe to link-state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }

    /// Current link state.
    pub fn current(&self) -> LinkState {
        *self.tx.borrow()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), LinkState::Offline);

        monitor.report(LinkState::Online(BandwidthClass::High));
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_online());
    }

    #[test]
    fn test_starts_offline() {
        let monitor = ConnectivityMonitor::new();
        assert!(!monitor.current().is_online());
    }
}
