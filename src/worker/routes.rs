//! Route wiring for the worker runtime.

use std::sync::Arc;

use crate::cluster::ClusterApi;
use crate::config::AppConfig;
use crate::queue::{ConsumerRuntime, RouteOptions};
use crate::store::{DeploymentStore, RequestStore};

use super::request_processor::RequestProcessor;
use super::update_processor::UpdateProcessor;

/// Registers both worker routes on the runtime.
pub fn register_routes(
    runtime: &mut ConsumerRuntime,
    config: &AppConfig,
    requests: Arc<dyn RequestStore>,
    deployments: Arc<dyn DeploymentStore>,
    cluster: Arc<dyn ClusterApi>,
) {
    let options = RouteOptions::default()
        .with_task_timeout(config.task_timeout)
        .with_retry_count(config.retry_count);

    runtime.route(
        &config.request_channel,
        Arc::new(RequestProcessor::new(requests, cluster.clone())),
        options.clone(),
    );
    runtime.route(
        &config.update_channel,
        Arc::new(UpdateProcessor::new(deployments, cluster)),
        options,
    );
}
