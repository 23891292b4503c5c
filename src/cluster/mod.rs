//! Cluster integration: manifest templating, reconciliation and change feed.
//!
//! Everything behind [`ClusterApi`] talks to Kubernetes; the rest of the
//! crate only sees the trait, so worker logic can be tested against a fake
//! cluster.

pub mod manifest;
mod reconciler;
mod watch;

pub use reconciler::KubeReconciler;
pub use watch::ChangeFeedWatcher;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::models::DeploymentRequest;

/// The managed workload kind. The cluster resource name of a workload is
/// always the deployment's identifier.
pub type Workload = k8s_openapi::api::apps::v1::Deployment;

/// Label carrying the deployment identifier.
pub const LABEL_IDENTIFIER: &str = "identifier";
/// Label carrying the user-facing deployment name.
pub const LABEL_NAME: &str = "name";
/// Label carrying the owning user's id.
pub const LABEL_USER_ID: &str = "user-id";
/// Label selecting workloads owned by this manager instance.
pub const LABEL_MANAGED_BY: &str = "managed-by";

/// Errors that can occur during cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The requested image has no manifest template.
    #[error("Unsupported image '{0}': only nginx is supported")]
    UnsupportedImage(String),

    /// Manifest template rendering failed.
    #[error("Template rendering failed: {0}")]
    Template(#[from] tera::Error),

    /// The rendered manifest failed to decode or validate.
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Stored request metadata could not be decoded or applied.
    #[error("Invalid request metadata: {0}")]
    InvalidMetadata(String),

    /// A resource quantity did not match the accepted format.
    #[error("Invalid resource quantity '{0}'")]
    InvalidQuantity(String),

    /// A workload with the same name already exists in the cluster.
    #[error("Workload '{0}' already exists in the cluster")]
    AlreadyExists(String),

    /// The cluster API rejected or failed the call.
    #[error("Cluster API error: {0}")]
    Api(#[from] kube::Error),
}

impl ClusterError {
    /// Whether retrying the same operation can ever succeed.
    ///
    /// Template, validation and quantity errors are deterministic; an
    /// existing workload does not disappear by retrying either. Only raw
    /// API failures are worth another attempt.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ClusterError::Api(_))
    }
}

/// True when the error is a Kubernetes 404.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when the error is a Kubernetes 409 conflict.
pub(crate) fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// Operations the workers need from the cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Materializes a CREATE request: renders the manifest, provisions the
    /// namespace and any document config map, then creates the workload.
    async fn create(&self, request: &DeploymentRequest) -> Result<Workload, ClusterError>;

    /// Applies an UPDATE request's metadata onto an existing workload and
    /// replaces it in the cluster.
    async fn update(
        &self,
        request: &DeploymentRequest,
        existing: Workload,
    ) -> Result<Workload, ClusterError>;

    /// Deletes a workload with foreground propagation. A workload that is
    /// already gone counts as success.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Fetches a workload, mapping 404 to `None`.
    async fn get_optional(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanence_classification() {
        assert!(ClusterError::UnsupportedImage("redis".to_string()).is_permanent());
        assert!(ClusterError::Manifest("no containers".to_string()).is_permanent());
        assert!(ClusterError::InvalidQuantity("5x".to_string()).is_permanent());
        assert!(ClusterError::AlreadyExists("web-a1b2".to_string()).is_permanent());

        let api_err = ClusterError::Api(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd leader changed".to_string(),
            reason: "ServerTimeout".to_string(),
            code: 500,
        }));
        assert!(!api_err.is_permanent());
    }

    #[test]
    fn test_kube_error_code_helpers() {
        let not_found = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&not_found));
        assert!(!is_already_exists(&not_found));

        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(is_already_exists(&conflict));
    }
}
