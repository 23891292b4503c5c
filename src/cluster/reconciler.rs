//! Kubernetes reconciler: materializes requests as cluster resources.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::store::models::DeploymentRequest;

use super::manifest::{
    apply_replica_count, apply_resource_limits, build_html_config_map, html_config_map_name,
    render_workload,
};
use super::{is_already_exists, is_not_found, ClusterApi, ClusterError, Workload};

/// [`ClusterApi`] implementation backed by a live Kubernetes client.
#[derive(Clone)]
pub struct KubeReconciler {
    client: Client,
    manager_tag: String,
}

impl KubeReconciler {
    /// Creates a reconciler over an existing client.
    pub fn new(client: Client, manager_tag: &str) -> Self {
        Self {
            client,
            manager_tag: manager_tag.to_string(),
        }
    }

    /// Connects using the ambient kubeconfig or in-cluster environment.
    pub async fn connect(manager_tag: &str) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, manager_tag))
    }

    fn workloads(&self, namespace: &str) -> Api<Workload> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Creates the namespace when it does not exist. A concurrent creation
    /// losing the race (409) counts as success.
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());

        if api.get_opt(namespace).await?.is_some() {
            return Ok(());
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace, "created namespace");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(ClusterError::Api(e)),
        }
    }

    /// Replaces the document config map, creating it when absent.
    async fn upsert_html_config_map(
        &self,
        identifier: &str,
        namespace: &str,
        doc_html: &str,
    ) -> Result<(), ClusterError> {
        let api = self.config_maps(namespace);
        let name = html_config_map_name(identifier);
        let mut config_map = build_html_config_map(identifier, namespace, doc_html);

        let existing = api.get_opt(&name).await?;
        match existing {
            Some(current) => {
                config_map.metadata.resource_version = current.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &config_map)
                    .await?;
            }
            None => {
                api.create(&PostParams::default(), &config_map).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeReconciler {
    async fn create(&self, request: &DeploymentRequest) -> Result<Workload, ClusterError> {
        let metadata = request
            .request_metadata()
            .map_err(|e| ClusterError::InvalidMetadata(e.to_string()))?;

        let doc_html = metadata.doc_html.as_deref().filter(|h| !h.is_empty());
        let replica_count = metadata.replica_count.unwrap_or(1);

        let mut workload =
            render_workload(request, &self.manager_tag, replica_count, doc_html.is_some())?;
        if let Some(resource_limit) = &metadata.resource_limit {
            apply_resource_limits(&mut workload, resource_limit)?;
        }

        self.ensure_namespace(&request.namespace).await?;

        // The config map must exist before the workload mounts it, otherwise
        // pods wedge in ContainerCreating
        if let Some(html) = doc_html {
            let config_map = build_html_config_map(&request.identifier, &request.namespace, html);
            self.config_maps(&request.namespace)
                .create(&PostParams::default(), &config_map)
                .await?;
        }

        let created = self
            .workloads(&request.namespace)
            .create(&PostParams::default(), &workload)
            .await
            .map_err(|e| {
                if is_already_exists(&e) {
                    ClusterError::AlreadyExists(request.identifier.clone())
                } else {
                    ClusterError::Api(e)
                }
            })?;

        info!(
            identifier = %request.identifier,
            namespace = %request.namespace,
            "created workload"
        );
        Ok(created)
    }

    async fn update(
        &self,
        request: &DeploymentRequest,
        existing: Workload,
    ) -> Result<Workload, ClusterError> {
        let metadata = request
            .request_metadata()
            .map_err(|e| ClusterError::InvalidMetadata(e.to_string()))?;

        let mut workload = existing;

        if let Some(replica_count) = metadata.replica_count {
            apply_replica_count(&mut workload, replica_count);
        }
        if let Some(resource_limit) = &metadata.resource_limit {
            apply_resource_limits(&mut workload, resource_limit)?;
        }
        if let Some(html) = metadata.doc_html.as_deref().filter(|h| !h.is_empty()) {
            self.upsert_html_config_map(&request.identifier, &request.namespace, html)
                .await?;
        }

        let name = workload
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::Manifest("existing workload has no name".to_string()))?;

        let updated = self
            .workloads(&request.namespace)
            .replace(&name, &PostParams::default(), &workload)
            .await?;

        info!(
            identifier = %request.identifier,
            namespace = %request.namespace,
            "updated workload"
        );
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let result = self
            .workloads(namespace)
            .delete(name, &DeleteParams::foreground())
            .await;

        match result {
            Ok(_) => {
                info!(namespace, name, "deleted workload");
                Ok(())
            }
            // Already gone is the state we wanted
            Err(e) if is_not_found(&e) => {
                debug!(namespace, name, "workload already absent on delete");
                Ok(())
            }
            Err(e) => Err(ClusterError::Api(e)),
        }
    }

    async fn get_optional(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, ClusterError> {
        Ok(self.workloads(namespace).get_opt(name).await?)
    }
}
