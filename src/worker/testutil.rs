//! In-memory fakes shared by the processor tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::cluster::{ClusterApi, ClusterError, Workload};
use crate::store::models::{Deployment, DeploymentRequest, DeploymentStatus, RequestStatus};
use crate::store::{DeploymentStore, RequestStore, StoreError};

#[derive(Default)]
pub struct MemoryRequests {
    pub rows: Mutex<Vec<DeploymentRequest>>,
    pub status_writes: Mutex<Vec<(Uuid, RequestStatus, Option<String>)>>,
}

#[async_trait]
impl RequestStore for MemoryRequests {
    async fn create_request(&self, request: &DeploymentRequest) -> Result<(), StoreError> {
        self.rows.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn get_request_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<DeploymentRequest>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().find(|r| r.request_id == request_id).cloned())
    }

    async fn list_requests_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DeploymentRequest>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|r| r.user_id == user_id).cloned().collect())
    }

    async fn update_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        self.status_writes
            .lock()
            .unwrap()
            .push((id, status, failure_reason.map(str::to_string)));
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|r| r.id == id && r.status == RequestStatus::Created)
        {
            row.status = status;
            row.failure_reason = failure_reason.map(str::to_string);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDeployments {
    pub rows: Mutex<Vec<Deployment>>,
    pub update_calls: Mutex<usize>,
    pub upsert_writes: Mutex<usize>,
}

#[async_trait]
impl DeploymentStore for MemoryDeployments {
    async fn get_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().find(|d| d.identifier == identifier).cloned())
    }

    async fn get_live_by_name_namespace(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|d| {
                d.name == name
                    && d.namespace == namespace
                    && d.status != DeploymentStatus::Deleted
            })
            .cloned())
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Deployment>, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().filter(|d| d.user_id == user_id).cloned().collect())
    }

    async fn update(&self, deployment: &Deployment) -> Result<(), StoreError> {
        *self.update_calls.lock().unwrap() += 1;
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|d| d.id == deployment.id) {
            *row = deployment.clone();
        }
        Ok(())
    }

    async fn upsert(&self, deployment: &Deployment) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|d| d.identifier == deployment.identifier) {
            // Equal resource_version: skipped entirely, not counted as a write
            Some(row) if row.resource_version == deployment.resource_version => {}
            Some(row) => {
                *self.upsert_writes.lock().unwrap() += 1;
                let id = row.id;
                let created_at = row.created_at;
                *row = deployment.clone();
                row.id = id;
                row.created_at = created_at;
            }
            None => {
                *self.upsert_writes.lock().unwrap() += 1;
                rows.push(deployment.clone());
            }
        }
        Ok(())
    }
}

/// Scripted cluster fake: records calls and fails with pre-loaded errors.
#[derive(Default)]
pub struct FakeCluster {
    pub calls: Mutex<Vec<String>>,
    pub create_errors: Mutex<Vec<ClusterError>>,
    pub update_errors: Mutex<Vec<ClusterError>>,
    pub delete_errors: Mutex<Vec<ClusterError>>,
    pub workloads: Mutex<HashMap<(String, String), Workload>>,
}

impl FakeCluster {
    pub fn push_create_error(&self, error: ClusterError) {
        self.create_errors.lock().unwrap().push(error);
    }

    pub fn insert_workload(&self, namespace: &str, name: &str, workload: Workload) {
        self.workloads
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), workload);
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn create(&self, request: &DeploymentRequest) -> Result<Workload, ClusterError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create:{}", request.identifier));
        if let Some(err) = self.create_errors.lock().unwrap().pop() {
            return Err(err);
        }
        Ok(Workload::default())
    }

    async fn update(
        &self,
        request: &DeploymentRequest,
        existing: Workload,
    ) -> Result<Workload, ClusterError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("update:{}", request.identifier));
        if let Some(err) = self.update_errors.lock().unwrap().pop() {
            return Err(err);
        }
        Ok(existing)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete:{}/{}", namespace, name));
        if let Some(err) = self.delete_errors.lock().unwrap().pop() {
            return Err(err);
        }
        Ok(())
    }

    async fn get_optional(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, ClusterError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("get:{}/{}", namespace, name));
        Ok(self
            .workloads
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

pub fn api_error(code: u16, reason: &str) -> ClusterError {
    ClusterError::Api(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

pub fn seeded_request(
    request_id: &str,
    request_type: crate::store::models::RequestType,
    user_id: Uuid,
) -> DeploymentRequest {
    let now = Utc::now();
    DeploymentRequest {
        id: Uuid::new_v4(),
        request_id: request_id.to_string(),
        identifier: "web-frontend-tenant-a-101".to_string(),
        name: "web-frontend".to_string(),
        namespace: "tenant-a".to_string(),
        request_type,
        status: RequestStatus::Created,
        image: "nginx:1.25".to_string(),
        user_id,
        metadata: serde_json::json!({}),
        failure_reason: None,
        created_at: now,
        updated_at: now,
    }
}
