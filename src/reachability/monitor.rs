use super::Reachability;
use tokio::sync::watch;

/// Shared reachability state fed by a poller (or by tests).
#[derive(Debug)]
pub struct ReachabilityMonitor {
    tx: watch::Sender<bool>,
}

impl ReachabilityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_reachable);
        Self { tx }
    }

    /// Publish a new reachability value. Subscribers are only woken when the
    /// value actually changes.
    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });

        if changed {
            tracing::info!(reachable = reachable, "Reachability changed");
        }
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Reachability for ReachabilityMonitor {
    fn is_currently_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
