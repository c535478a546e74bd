pub mod monitor;
pub mod poller;

pub use monitor::ReachabilityMonitor;
pub use poller::ReachabilityPoller;

use tokio::sync::watch;

/// Point-in-time connectivity plus a push stream of changes.
///
/// Subscribers receive the latest value on every change. Uploaders only act
/// on `false -> true` transitions, so repeated identical values are harmless.
pub trait Reachability: Send + Sync {
    fn is_currently_reachable(&self) -> bool;

    fn subscribe(&self) -> watch::Receiver<bool>;
}
