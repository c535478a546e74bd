use super::monitor::ReachabilityMonitor;
use crate::config::types::ReachabilityConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polls the backend over HTTP and publishes the result into a
/// [`ReachabilityMonitor`]. Any HTTP response counts as reachable; transport
/// failures count as unreachable.
#[derive(Debug)]
pub struct ReachabilityPoller {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl ReachabilityPoller {
    pub fn new(config: &ReachabilityConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            url: config.check_url.clone(),
            interval: config.check_interval,
        })
    }

    pub async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Reachability check failed");
                false
            }
        }
    }

    pub async fn run(self, monitor: Arc<ReachabilityMonitor>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let reachable = self.check().await;
                    monitor.set_reachable(reachable);
                }
            }
        }

        tracing::debug!("Reachability poller stopped");
    }
}
