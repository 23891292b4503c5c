//! Change feed: watches managed workloads and publishes change events.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::queue::{ChangeEventType, UpdateMessage, UpdatePublisher};

use super::{ClusterError, Workload, LABEL_MANAGED_BY};

/// Watches workloads carrying this manager's tag across all namespaces and
/// turns every change into an [`UpdateMessage`].
///
/// A periodic resync lists all managed workloads and republishes them as
/// modifications, so rows that drifted (a missed event, a manual cluster
/// change) converge without waiting for the next real change. The first
/// resync fires immediately on startup.
pub struct ChangeFeedWatcher {
    client: Client,
    manager_tag: String,
    publisher: Arc<dyn UpdatePublisher>,
    resync_interval: Duration,
}

impl ChangeFeedWatcher {
    pub fn new(
        client: Client,
        manager_tag: &str,
        publisher: Arc<dyn UpdatePublisher>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            client,
            manager_tag: manager_tag.to_string(),
            publisher,
            resync_interval,
        }
    }

    fn selector(&self) -> String {
        format!("{}={}", LABEL_MANAGED_BY, self.manager_tag)
    }

    /// Runs the watch loop until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), ClusterError> {
        let selector = self.selector();
        let api: Api<Workload> = Api::all(self.client.clone());

        info!(selector = %selector, "change feed watcher started");

        let config = watcher::Config::default().labels(&selector);
        let mut stream = watcher(api.clone(), config).boxed();

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = resync.tick() => {
                    if let Err(e) = self.resync(&api, &selector).await {
                        warn!(error = %e, "resync failed");
                    }
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        // The watcher restarts itself; just avoid a hot loop
                        warn!(error = %e, "watch stream error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    None => break,
                }
            }
        }

        info!("change feed watcher stopped");
        Ok(())
    }

    async fn handle_event(&self, event: watcher::Event<Workload>) {
        match event {
            watcher::Event::Applied(workload) => {
                self.publish(&workload, ChangeEventType::Modified).await;
            }
            watcher::Event::Deleted(workload) => {
                self.publish(&workload, ChangeEventType::Deleted).await;
            }
            watcher::Event::Restarted(workloads) => {
                for workload in &workloads {
                    self.publish(workload, ChangeEventType::Modified).await;
                }
            }
        }
    }

    /// Lists every managed workload and republishes it as a modification.
    async fn resync(&self, api: &Api<Workload>, selector: &str) -> Result<(), ClusterError> {
        let params = ListParams::default().labels(selector);
        let workloads = api.list(&params).await?;

        info!(count = workloads.items.len(), "resyncing managed workloads");
        for workload in &workloads.items {
            self.publish(workload, ChangeEventType::Modified).await;
        }
        Ok(())
    }

    async fn publish(&self, workload: &Workload, event_type: ChangeEventType) {
        let Some(name) = workload.metadata.name.as_deref() else {
            warn!("observed workload without a name, skipping");
            return;
        };
        let namespace = workload.metadata.namespace.as_deref().unwrap_or("default");

        let message = UpdateMessage::new(namespace, name, event_type);
        if let Err(e) = self.publisher.publish_update(&message).await {
            error!(
                identifier = %message.identifier,
                error = %e,
                "failed to publish change event"
            );
        }
    }
}
