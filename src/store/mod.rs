//! Relational store: durable records for requests, deployments and users.
//!
//! The store is consumed through the capability traits below so that the
//! intake layer and the queue processors can be exercised against in-memory
//! implementations in tests. The PostgreSQL implementation lives in
//! [`database`].

mod database;
mod migrations;
pub mod models;
mod schema;

pub use database::{Database, StoreError};
pub use migrations::{MigrationError, MigrationRunner};

use async_trait::async_trait;
use uuid::Uuid;

use models::{Deployment, DeploymentRequest, RequestStatus, User};

/// Access to deployment request rows.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persists a new request row. Fails with a unique violation when the
    /// request_id is already taken (the insert-time idempotency guard).
    async fn create_request(&self, request: &DeploymentRequest) -> Result<(), StoreError>;

    /// Looks up a request by its client-supplied idempotency key.
    async fn get_request_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<DeploymentRequest>, StoreError>;

    /// Lists all requests belonging to a user, newest first.
    async fn list_requests_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DeploymentRequest>, StoreError>;

    /// Writes a terminal status. The write only lands while the row is still
    /// CREATED, so a terminal status can never be set twice or reversed.
    async fn update_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Access to deployment rows.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Looks up a deployment by its cluster-resource identifier.
    async fn get_by_identifier(&self, identifier: &str)
        -> Result<Option<Deployment>, StoreError>;

    /// Looks up the live (non-DELETED) deployment for a (name, namespace)
    /// pair. At most one such row exists at any time.
    async fn get_live_by_name_namespace(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Lists all deployments belonging to a user.
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Deployment>, StoreError>;

    /// Updates an existing row by id.
    async fn update(&self, deployment: &Deployment) -> Result<(), StoreError>;

    /// Creates or updates a row keyed by identifier.
    ///
    /// When a row with the same identifier exists and its resource_version
    /// equals the incoming one, the write is skipped entirely. The comparison
    /// is equality-only; a version string reused after an external rollback is
    /// silently skipped.
    async fn upsert(&self, deployment: &Deployment) -> Result<(), StoreError>;
}

/// Access to user rows.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Looks up a user by their external identity.
    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError>;

    /// Persists a new user row.
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
}
