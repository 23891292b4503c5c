//! Update processor: reconciles observed cluster state into the store.
//!
//! Change events carry only a `namespace/name` pointer; the processor reads
//! both sides (store row by identifier, cluster workload by name) and
//! converges the row onto what the cluster shows. The store's
//! resource-version guard makes replayed events no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::cluster::{ClusterApi, Workload, LABEL_IDENTIFIER, LABEL_NAME, LABEL_USER_ID};
use crate::queue::{HandlerOutcome, MessageContext, MessageHandler, UpdateMessage};
use crate::store::models::{Deployment, DeploymentStatus};
use crate::store::DeploymentStore;

/// Why an observed workload could not be mapped to a store row.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("workload missing '{0}' label")]
    MissingLabel(&'static str),

    #[error("workload has invalid user-id label: {0}")]
    InvalidUserId(String),

    #[error("workload has no resource version")]
    MissingResourceVersion,

    #[error("workload state could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct UpdateProcessor {
    deployments: Arc<dyn DeploymentStore>,
    cluster: Arc<dyn ClusterApi>,
}

impl UpdateProcessor {
    pub fn new(deployments: Arc<dyn DeploymentStore>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self { deployments, cluster }
    }
}

#[async_trait]
impl MessageHandler for UpdateProcessor {
    async fn handle(&self, payload: &str, _ctx: &MessageContext) -> HandlerOutcome {
        let message: UpdateMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                return HandlerOutcome::PermanentFailure(format!("unparseable payload: {}", e));
            }
        };

        let Some((namespace, name)) = message.split_identifier() else {
            return HandlerOutcome::PermanentFailure(format!(
                "malformed workload identifier '{}'",
                message.identifier
            ));
        };

        let stored = match self.deployments.get_by_identifier(name).await {
            Ok(stored) => stored,
            Err(e) => return HandlerOutcome::RetryableFailure(e.to_string()),
        };
        let observed = match self.cluster.get_optional(namespace, name).await {
            Ok(observed) => observed,
            Err(e) => return HandlerOutcome::RetryableFailure(e.to_string()),
        };

        match (stored, observed) {
            // Neither side knows the resource: nothing to converge
            (None, None) => HandlerOutcome::Success,
            (Some(stored), None) => self.mark_deleted(stored).await,
            (_, Some(observed)) => self.converge(observed).await,
        }
    }
}

impl UpdateProcessor {
    /// The cluster no longer has the workload: the row becomes DELETED.
    /// A row already marked DELETED is left untouched.
    async fn mark_deleted(&self, mut stored: Deployment) -> HandlerOutcome {
        if stored.status == DeploymentStatus::Deleted {
            return HandlerOutcome::Success;
        }

        stored.status = DeploymentStatus::Deleted;
        stored.updated_at = Utc::now();
        if let Err(e) = self.deployments.update(&stored).await {
            return HandlerOutcome::RetryableFailure(e.to_string());
        }

        info!(identifier = %stored.identifier, "marked deployment deleted");
        HandlerOutcome::Success
    }

    async fn converge(&self, observed: Workload) -> HandlerOutcome {
        let extracted = match extract_deployment(&observed) {
            Ok(extracted) => extracted,
            // An unlabelled workload can never become labelled by retrying
            Err(e) => return HandlerOutcome::PermanentFailure(e.to_string()),
        };

        if let Err(e) = self.deployments.upsert(&extracted).await {
            return HandlerOutcome::RetryableFailure(e.to_string());
        }

        info!(
            identifier = %extracted.identifier,
            resource_version = %extracted.resource_version,
            status = %extracted.status.as_str(),
            "converged deployment row"
        );
        HandlerOutcome::Success
    }
}

/// Maps an observed workload onto a store row using its management labels.
pub fn extract_deployment(workload: &Workload) -> Result<Deployment, ExtractionError> {
    let labels = workload.metadata.labels.as_ref();
    let label = |key: &'static str| -> Result<&str, ExtractionError> {
        labels
            .and_then(|l| l.get(key))
            .map(String::as_str)
            .ok_or(ExtractionError::MissingLabel(key))
    };

    let identifier = label(LABEL_IDENTIFIER)?;
    let name = label(LABEL_NAME)?;
    let user_id = Uuid::parse_str(label(LABEL_USER_ID)?)
        .map_err(|e| ExtractionError::InvalidUserId(e.to_string()))?;

    let resource_version = workload
        .metadata
        .resource_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(ExtractionError::MissingResourceVersion)?;

    let namespace = workload
        .metadata
        .namespace
        .as_deref()
        .unwrap_or("default");

    let image = workload
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref())
        .unwrap_or_default();

    let now = Utc::now();
    Ok(Deployment {
        id: Uuid::new_v4(),
        identifier: identifier.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        image: image.to_string(),
        status: derive_status(workload),
        user_id,
        resource_version: resource_version.to_string(),
        metadata: serde_json::json!({ "workload": serde_json::to_value(workload)? }),
        created_at: now,
        updated_at: now,
    })
}

/// Derives the row status from the observed workload state.
pub fn derive_status(workload: &Workload) -> DeploymentStatus {
    if workload.metadata.deletion_timestamp.is_some() {
        return DeploymentStatus::Deleted;
    }

    if let Some(status) = &workload.status {
        let ready = status.ready_replicas.unwrap_or(0);
        let total = status.replicas.unwrap_or(0);
        if ready > 0 && ready == total {
            return DeploymentStatus::Created;
        }

        if let Some(conditions) = &status.conditions {
            let progressing = conditions
                .iter()
                .any(|c| c.type_ == "Progressing" && c.status == "True");
            if progressing {
                return DeploymentStatus::Updating;
            }
        }
    }

    DeploymentStatus::Initiated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testutil::{FakeCluster, MemoryDeployments};
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus as WorkloadStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    fn context() -> MessageContext {
        MessageContext {
            request_id: None,
            user_id: None,
            attempt: 1,
            final_attempt: false,
        }
    }

    fn payload(namespace: &str, name: &str) -> String {
        let message = UpdateMessage::new(
            namespace,
            name,
            crate::queue::ChangeEventType::Modified,
        );
        serde_json::to_string(&message).expect("serialize")
    }

    fn labelled_workload(identifier: &str, user_id: Uuid, resource_version: &str) -> Workload {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_IDENTIFIER.to_string(), identifier.to_string());
        labels.insert(LABEL_NAME.to_string(), "web-frontend".to_string());
        labels.insert(LABEL_USER_ID.to_string(), user_id.to_string());

        let mut workload = Workload::default();
        workload.metadata.name = Some(identifier.to_string());
        workload.metadata.namespace = Some("tenant-a".to_string());
        workload.metadata.labels = Some(labels);
        workload.metadata.resource_version = Some(resource_version.to_string());
        workload
    }

    fn harness() -> (UpdateProcessor, Arc<MemoryDeployments>, Arc<FakeCluster>) {
        let deployments = Arc::new(MemoryDeployments::default());
        let cluster = Arc::new(FakeCluster::default());
        let processor = UpdateProcessor::new(deployments.clone(), cluster.clone());
        (processor, deployments, cluster)
    }

    #[tokio::test]
    async fn test_absent_everywhere_is_a_noop() {
        let (processor, deployments, _) = harness();

        let outcome = processor
            .handle(&payload("tenant-a", "ghost-101"), &context())
            .await;

        assert_eq!(outcome, HandlerOutcome::Success);
        assert!(deployments.rows.lock().unwrap().is_empty());
        assert_eq!(*deployments.update_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_only_row_marked_deleted_idempotently() {
        let (processor, deployments, cluster) = harness();
        let user_id = Uuid::new_v4();
        let workload = labelled_workload("web-101", user_id, "5");
        let row = extract_deployment(&workload).expect("extract");
        deployments.upsert(&row).await.expect("seed");
        // Workload is NOT inserted into the fake cluster: it is gone
        let _ = cluster;

        let outcome = processor
            .handle(&payload("tenant-a", "web-101"), &context())
            .await;
        assert_eq!(outcome, HandlerOutcome::Success);
        assert_eq!(
            deployments.rows.lock().unwrap()[0].status,
            DeploymentStatus::Deleted
        );
        assert_eq!(*deployments.update_calls.lock().unwrap(), 1);

        // Second delivery of the same event changes nothing
        let outcome = processor
            .handle(&payload("tenant-a", "web-101"), &context())
            .await;
        assert_eq!(outcome, HandlerOutcome::Success);
        assert_eq!(*deployments.update_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_observed_workload_upserted_from_labels() {
        let (processor, deployments, cluster) = harness();
        let user_id = Uuid::new_v4();
        cluster.insert_workload("tenant-a", "web-101", labelled_workload("web-101", user_id, "7"));

        let outcome = processor
            .handle(&payload("tenant-a", "web-101"), &context())
            .await;

        assert_eq!(outcome, HandlerOutcome::Success);
        let rows = deployments.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, "web-101");
        assert_eq!(rows[0].name, "web-frontend");
        assert_eq!(rows[0].user_id, user_id);
        assert_eq!(rows[0].resource_version, "7");
    }

    #[tokio::test]
    async fn test_replayed_event_skips_the_write() {
        let (processor, deployments, cluster) = harness();
        let user_id = Uuid::new_v4();
        cluster.insert_workload("tenant-a", "web-101", labelled_workload("web-101", user_id, "7"));

        processor
            .handle(&payload("tenant-a", "web-101"), &context())
            .await;
        processor
            .handle(&payload("tenant-a", "web-101"), &context())
            .await;

        // Same resource version twice: exactly one effective write
        assert_eq!(*deployments.upsert_writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unlabelled_workload_is_permanent_failure() {
        let (processor, _, cluster) = harness();
        cluster.insert_workload("tenant-a", "web-101", Workload::default());

        let outcome = processor
            .handle(&payload("tenant-a", "web-101"), &context())
            .await;
        assert!(matches!(outcome, HandlerOutcome::PermanentFailure(_)));
    }

    #[tokio::test]
    async fn test_malformed_workload_identifier_is_permanent() {
        let (processor, _, _) = harness();
        let message = serde_json::json!({
            "identifier": "no-separator",
            "event_type": "MODIFIED",
        });

        let outcome = processor
            .handle(&message.to_string(), &context())
            .await;
        assert!(matches!(outcome, HandlerOutcome::PermanentFailure(_)));
    }

    #[test]
    fn test_status_derivation() {
        let user_id = Uuid::new_v4();

        // Deletion timestamp wins over everything
        let mut deleting = labelled_workload("web-101", user_id, "1");
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        deleting.status = Some(WorkloadStatus {
            ready_replicas: Some(3),
            replicas: Some(3),
            ..Default::default()
        });
        assert_eq!(derive_status(&deleting), DeploymentStatus::Deleted);

        // All replicas ready
        let mut ready = labelled_workload("web-101", user_id, "1");
        ready.status = Some(WorkloadStatus {
            ready_replicas: Some(2),
            replicas: Some(2),
            ..Default::default()
        });
        assert_eq!(derive_status(&ready), DeploymentStatus::Created);

        // Progressing but not ready
        let mut progressing = labelled_workload("web-101", user_id, "1");
        progressing.status = Some(WorkloadStatus {
            ready_replicas: Some(1),
            replicas: Some(3),
            conditions: Some(vec![DeploymentCondition {
                type_: "Progressing".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(derive_status(&progressing), DeploymentStatus::Updating);

        // Nothing conclusive
        let bare = labelled_workload("web-101", user_id, "1");
        assert_eq!(derive_status(&bare), DeploymentStatus::Initiated);

        // Zero ready replicas never counts as created
        let mut empty = labelled_workload("web-101", user_id, "1");
        empty.status = Some(WorkloadStatus {
            ready_replicas: Some(0),
            replicas: Some(0),
            ..Default::default()
        });
        assert_eq!(derive_status(&empty), DeploymentStatus::Initiated);
    }

    #[test]
    fn test_extract_requires_resource_version() {
        let user_id = Uuid::new_v4();
        let mut workload = labelled_workload("web-101", user_id, "1");
        workload.metadata.resource_version = None;

        let err = extract_deployment(&workload).unwrap_err();
        assert!(matches!(err, ExtractionError::MissingResourceVersion));
    }
}
