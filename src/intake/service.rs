//! Intake service: the write path for deployment requests.
//!
//! Every mutation follows the same shape: validate, check idempotency and
//! ownership, persist the request row, then publish a pointer message for
//! worker pickup. The row is the source of truth; the message only carries
//! the request id.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::IntakeError;
use crate::queue::{RequestMessage, RequestPublisher};
use crate::store::models::{
    Deployment, DeploymentRequest, DeploymentStatus, RequestMetadata, RequestStatus, RequestType,
    User,
};
use crate::store::{DeploymentStore, RequestStore, StoreError, UserStore};

use super::identifier::generate_identifier;

const MAX_FIELD_LEN: usize = 255;

/// Input for a CREATE request.
#[derive(Debug, Clone)]
pub struct CreateDeployment {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub metadata: RequestMetadata,
}

/// Intake service over the store and the request channel.
pub struct IntakeService {
    requests: Arc<dyn RequestStore>,
    deployments: Arc<dyn DeploymentStore>,
    users: Arc<dyn UserStore>,
    publisher: Arc<dyn RequestPublisher>,
}

impl IntakeService {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        deployments: Arc<dyn DeploymentStore>,
        users: Arc<dyn UserStore>,
        publisher: Arc<dyn RequestPublisher>,
    ) -> Self {
        Self {
            requests,
            deployments,
            users,
            publisher,
        }
    }

    /// Looks up a user by external identity, creating the row on first use.
    ///
    /// Two callers racing on the same identity both end up with the same
    /// row: the loser of the insert re-reads.
    pub async fn ensure_user(&self, external_id: &str) -> Result<User, IntakeError> {
        if external_id.is_empty() {
            return Err(IntakeError::Validation(
                "external user id is required".to_string(),
            ));
        }

        if let Some(user) = self.users.get_by_external_id(external_id).await? {
            return Ok(user);
        }

        let user = User::new(external_id);
        match self.users.create_user(&user).await {
            Ok(()) => {
                info!(external_id, user_id = %user.id, "created user");
                Ok(user)
            }
            Err(e) if e.is_unique_violation() => {
                match self.users.get_by_external_id(external_id).await? {
                    Some(user) => Ok(user),
                    None => Err(IntakeError::Store(e)),
                }
            }
            Err(e) => Err(IntakeError::Store(e)),
        }
    }

    /// Accepts a CREATE request.
    ///
    /// Rejects a reused request id and a (name, namespace) pair that already
    /// has a live deployment, then persists the row and publishes it.
    pub async fn create_request(
        &self,
        input: &CreateDeployment,
        request_id: &str,
        user_id: Uuid,
    ) -> Result<DeploymentRequest, IntakeError> {
        validate_request_id(request_id)?;
        validate_field("name", &input.name)?;
        validate_field("namespace", &input.namespace)?;
        validate_field("image", &input.image)?;
        validate_metadata(&input.metadata)?;

        if self.requests.get_request_by_request_id(request_id).await?.is_some() {
            return Err(IntakeError::DuplicateRequest(request_id.to_string()));
        }

        if self
            .deployments
            .get_live_by_name_namespace(&input.name, &input.namespace)
            .await?
            .is_some()
        {
            return Err(IntakeError::AlreadyExists {
                name: input.name.clone(),
                namespace: input.namespace.clone(),
            });
        }

        let identifier = generate_identifier(&input.name, &input.namespace);
        let request = build_request(
            request_id,
            &identifier,
            &input.name,
            &input.namespace,
            RequestType::Create,
            &input.image,
            user_id,
            &input.metadata,
        )?;

        self.persist_and_publish(request).await
    }

    /// Accepts an UPDATE request against an existing deployment.
    ///
    /// The deployment must exist, belong to the caller and not be deleted;
    /// the metadata patch must change at least one field.
    pub async fn update_request(
        &self,
        target_identifier: &str,
        metadata: &RequestMetadata,
        request_id: &str,
        user_id: Uuid,
    ) -> Result<DeploymentRequest, IntakeError> {
        validate_request_id(request_id)?;
        if metadata.is_empty() {
            return Err(IntakeError::Validation(
                "update must set at least one of replica_count, resource_limit, doc_html"
                    .to_string(),
            ));
        }
        validate_metadata(metadata)?;

        if self.requests.get_request_by_request_id(request_id).await?.is_some() {
            return Err(IntakeError::DuplicateRequest(request_id.to_string()));
        }

        let deployment = self.owned_deployment(target_identifier, user_id).await?;
        if deployment.status == DeploymentStatus::Deleted {
            return Err(IntakeError::AlreadyDeleted(target_identifier.to_string()));
        }

        let request = build_request(
            request_id,
            &deployment.identifier,
            &deployment.name,
            &deployment.namespace,
            RequestType::Update,
            &deployment.image,
            user_id,
            metadata,
        )?;

        self.persist_and_publish(request).await
    }

    /// Accepts a DELETE request against an existing deployment.
    pub async fn delete_request(
        &self,
        target_identifier: &str,
        request_id: &str,
        user_id: Uuid,
    ) -> Result<DeploymentRequest, IntakeError> {
        validate_request_id(request_id)?;

        if self.requests.get_request_by_request_id(request_id).await?.is_some() {
            return Err(IntakeError::DuplicateRequest(request_id.to_string()));
        }

        let deployment = self.owned_deployment(target_identifier, user_id).await?;
        if deployment.status == DeploymentStatus::Deleted {
            return Err(IntakeError::AlreadyDeleted(target_identifier.to_string()));
        }

        let request = build_request(
            request_id,
            &deployment.identifier,
            &deployment.name,
            &deployment.namespace,
            RequestType::Delete,
            &deployment.image,
            user_id,
            &RequestMetadata::default(),
        )?;

        self.persist_and_publish(request).await
    }

    /// Lists the caller's requests, newest first.
    pub async fn list_requests(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DeploymentRequest>, IntakeError> {
        Ok(self.requests.list_requests_by_user(user_id).await?)
    }

    /// Fetches one request by request id, scoped to the caller.
    ///
    /// A request owned by someone else reads as absent, so callers cannot
    /// probe for foreign request ids.
    pub async fn get_request(
        &self,
        request_id: &str,
        user_id: Uuid,
    ) -> Result<DeploymentRequest, IntakeError> {
        match self.requests.get_request_by_request_id(request_id).await? {
            Some(request) if request.user_id == user_id => Ok(request),
            _ => Err(IntakeError::NotFound(request_id.to_string())),
        }
    }

    /// Lists the caller's deployments.
    pub async fn list_deployments(&self, user_id: Uuid) -> Result<Vec<Deployment>, IntakeError> {
        Ok(self.deployments.list_by_user(user_id).await?)
    }

    /// Fetches one deployment by identifier, scoped to the caller.
    pub async fn get_deployment(
        &self,
        identifier: &str,
        user_id: Uuid,
    ) -> Result<Deployment, IntakeError> {
        self.owned_deployment(identifier, user_id).await
    }

    async fn owned_deployment(
        &self,
        identifier: &str,
        user_id: Uuid,
    ) -> Result<Deployment, IntakeError> {
        match self.deployments.get_by_identifier(identifier).await? {
            Some(deployment) if deployment.user_id == user_id => Ok(deployment),
            _ => Err(IntakeError::NotFound(identifier.to_string())),
        }
    }

    async fn persist_and_publish(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentRequest, IntakeError> {
        match self.requests.create_request(&request).await {
            Ok(()) => {}
            // The insert-time guard on request_id catches races the
            // pre-flight read missed
            Err(e) if e.is_unique_violation() => {
                return Err(IntakeError::DuplicateRequest(request.request_id));
            }
            Err(e) => return Err(IntakeError::Store(e)),
        }

        let message = RequestMessage::new(&request.request_id, request.user_id);
        if let Err(e) = self.publisher.publish_request(&message).await {
            // The row is already durable; surfacing the error lets the
            // caller retry with a fresh request id
            error!(request_id = %request.request_id, error = %e, "publish failed after persist");
            return Err(IntakeError::Publish(e));
        }

        info!(
            request_id = %request.request_id,
            identifier = %request.identifier,
            request_type = %request.request_type.as_str(),
            "request accepted"
        );
        Ok(request)
    }
}

fn validate_request_id(request_id: &str) -> Result<(), IntakeError> {
    if request_id.is_empty() {
        return Err(IntakeError::Validation("request id is required".to_string()));
    }
    if request_id.len() > MAX_FIELD_LEN {
        return Err(IntakeError::Validation(format!(
            "request id exceeds {} characters",
            MAX_FIELD_LEN
        )));
    }
    Ok(())
}

fn validate_metadata(metadata: &RequestMetadata) -> Result<(), IntakeError> {
    if let Some(count) = metadata.replica_count {
        if count < 0 {
            return Err(IntakeError::Validation(
                "replica_count must not be negative".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_field(field: &str, value: &str) -> Result<(), IntakeError> {
    if value.trim().is_empty() {
        return Err(IntakeError::Validation(format!("{} is required", field)));
    }
    if value.len() > MAX_FIELD_LEN {
        return Err(IntakeError::Validation(format!(
            "{} exceeds {} characters",
            field, MAX_FIELD_LEN
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    request_id: &str,
    identifier: &str,
    name: &str,
    namespace: &str,
    request_type: RequestType,
    image: &str,
    user_id: Uuid,
    metadata: &RequestMetadata,
) -> Result<DeploymentRequest, IntakeError> {
    let now = Utc::now();
    let metadata = serde_json::to_value(metadata).map_err(StoreError::Serialization)?;

    Ok(DeploymentRequest {
        id: Uuid::new_v4(),
        request_id: request_id.to_string(),
        identifier: identifier.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        request_type,
        status: RequestStatus::Created,
        image: image.to_string(),
        user_id,
        metadata,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryRequests {
        rows: Mutex<Vec<DeploymentRequest>>,
    }

    #[async_trait]
    impl RequestStore for MemoryRequests {
        async fn create_request(&self, request: &DeploymentRequest) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.iter().any(|r| r.request_id == request.request_id) {
                return Err(StoreError::UniqueViolation("request_id".to_string()));
            }
            rows.push(request.clone());
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
    struct MemoryDeployments {
        rows: Mutex<Vec<Deployment>>,
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
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|d| d.id == deployment.id) {
                *row = deployment.clone();
            }
            Ok(())
        }

        async fn upsert(&self, deployment: &Deployment) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            match rows.iter_mut().find(|d| d.identifier == deployment.identifier) {
                Some(row) if row.resource_version == deployment.resource_version => {}
                Some(row) => {
                    let id = row.id;
                    let created_at = row.created_at;
                    *row = deployment.clone();
                    row.id = id;
                    row.created_at = created_at;
                }
                None => rows.push(deployment.clone()),
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryUsers {
        rows: Mutex<Vec<User>>,
    }

    #[async_trait]
    impl UserStore for MemoryUsers {
        async fn get_by_external_id(
            &self,
            external_id: &str,
        ) -> Result<Option<User>, StoreError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().find(|u| u.external_id == external_id).cloned())
        }

        async fn create_user(&self, user: &User) -> Result<(), StoreError> {
            let mut rows = self.rows.lock().unwrap();
            if rows.iter().any(|u| u.external_id == user.external_id) {
                return Err(StoreError::UniqueViolation("external_id".to_string()));
            }
            rows.push(user.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<RequestMessage>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl RequestPublisher for RecordingPublisher {
        async fn publish_request(&self, message: &RequestMessage) -> Result<(), crate::queue::QueueError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::queue::QueueError::ConnectionFailed(
                    "broker down".to_string(),
                ));
            }
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct Harness {
        service: IntakeService,
        requests: Arc<MemoryRequests>,
        deployments: Arc<MemoryDeployments>,
        publisher: Arc<RecordingPublisher>,
    }

    fn harness() -> Harness {
        let requests = Arc::new(MemoryRequests::default());
        let deployments = Arc::new(MemoryDeployments::default());
        let users = Arc::new(MemoryUsers::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let service = IntakeService::new(
            requests.clone(),
            deployments.clone(),
            users.clone(),
            publisher.clone(),
        );
        Harness {
            service,
            requests,
            deployments,
            publisher,
        }
    }

    fn create_input() -> CreateDeployment {
        CreateDeployment {
            name: "web-frontend".to_string(),
            namespace: "tenant-a".to_string(),
            image: "nginx:1.25".to_string(),
            metadata: RequestMetadata::default(),
        }
    }

    fn seed_deployment(h: &Harness, identifier: &str, user_id: Uuid, status: DeploymentStatus) {
        let now = Utc::now();
        h.deployments.rows.lock().unwrap().push(Deployment {
            id: Uuid::new_v4(),
            identifier: identifier.to_string(),
            name: "web-frontend".to_string(),
            namespace: "tenant-a".to_string(),
            image: "nginx:1.25".to_string(),
            status,
            user_id,
            resource_version: "1".to_string(),
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        });
    }

    #[tokio::test]
    async fn test_create_persists_and_publishes() {
        let h = harness();
        let user_id = Uuid::new_v4();

        let request = h
            .service
            .create_request(&create_input(), "req-1", user_id)
            .await
            .expect("create");

        assert_eq!(request.request_type, RequestType::Create);
        assert_eq!(request.status, RequestStatus::Created);
        assert!(request.identifier.starts_with("web-frontend-tenant-a-"));

        let published = h.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].request_id, "req-1");
        assert_eq!(published[0].user_id, user_id);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_rejected_without_republish() {
        let h = harness();
        let user_id = Uuid::new_v4();

        h.service
            .create_request(&create_input(), "req-1", user_id)
            .await
            .expect("first create");

        let err = h
            .service
            .create_request(&create_input(), "req-1", user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::DuplicateRequest(_)));

        assert_eq!(h.publisher.published.lock().unwrap().len(), 1);
        assert_eq!(h.requests.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_live_name_collision() {
        let h = harness();
        let user_id = Uuid::new_v4();
        seed_deployment(&h, "web-frontend-tenant-a-101", user_id, DeploymentStatus::Created);

        let err = h
            .service
            .create_request(&create_input(), "req-2", user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_create_allowed_after_previous_deleted() {
        let h = harness();
        let user_id = Uuid::new_v4();
        seed_deployment(&h, "web-frontend-tenant-a-101", user_id, DeploymentStatus::Deleted);

        h.service
            .create_request(&create_input(), "req-2", user_id)
            .await
            .expect("deleted rows do not block reuse of the name");
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let h = harness();
        let user_id = Uuid::new_v4();

        let mut input = create_input();
        input.name = "  ".to_string();
        let err = h.service.create_request(&input, "req-1", user_id).await.unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));

        let err = h
            .service
            .create_request(&create_input(), "", user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));

        let mut input = create_input();
        input.metadata.replica_count = Some(-1);
        let err = h.service.create_request(&input, "req-1", user_id).await.unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_requires_patch_and_live_row() {
        let h = harness();
        let user_id = Uuid::new_v4();
        seed_deployment(&h, "web-frontend-tenant-a-101", user_id, DeploymentStatus::Created);

        let err = h
            .service
            .update_request(
                "web-frontend-tenant-a-101",
                &RequestMetadata::default(),
                "req-1",
                user_id,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Validation(_)));

        let patch = RequestMetadata {
            replica_count: Some(3),
            ..Default::default()
        };
        let request = h
            .service
            .update_request("web-frontend-tenant-a-101", &patch, "req-1", user_id)
            .await
            .expect("update");
        assert_eq!(request.request_type, RequestType::Update);
        assert_eq!(request.identifier, "web-frontend-tenant-a-101");
        assert_eq!(request.name, "web-frontend");
    }

    #[tokio::test]
    async fn test_update_rejects_deleted_and_foreign_rows() {
        let h = harness();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        seed_deployment(&h, "gone-101", owner, DeploymentStatus::Deleted);
        seed_deployment(&h, "live-102", owner, DeploymentStatus::Created);

        let patch = RequestMetadata {
            replica_count: Some(2),
            ..Default::default()
        };

        let err = h
            .service
            .update_request("gone-101", &patch, "req-1", owner)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::AlreadyDeleted(_)));

        // Foreign rows read as absent, never as forbidden
        let err = h
            .service
            .update_request("live-102", &patch, "req-2", stranger)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_builds_row_from_deployment() {
        let h = harness();
        let user_id = Uuid::new_v4();
        seed_deployment(&h, "web-frontend-tenant-a-101", user_id, DeploymentStatus::Created);

        let request = h
            .service
            .delete_request("web-frontend-tenant-a-101", "req-1", user_id)
            .await
            .expect("delete");

        assert_eq!(request.request_type, RequestType::Delete);
        assert_eq!(request.namespace, "tenant-a");
        assert_eq!(request.image, "nginx:1.25");
        assert_eq!(request.metadata, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces_but_row_persists() {
        let h = harness();
        let user_id = Uuid::new_v4();
        h.publisher.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = h
            .service
            .create_request(&create_input(), "req-1", user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Publish(_)));
        assert_eq!(h.requests.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let h = harness();

        let first = h.service.ensure_user("auth0|alice").await.expect("create");
        let second = h.service.ensure_user("auth0|alice").await.expect("reuse");
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_get_request_scopes_by_owner() {
        let h = harness();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        h.service
            .create_request(&create_input(), "req-1", owner)
            .await
            .expect("create");

        assert!(h.service.get_request("req-1", owner).await.is_ok());
        let err = h.service.get_request("req-1", stranger).await.unwrap_err();
        assert!(matches!(err, IntakeError::NotFound(_)));
    }
}
