//! PostgreSQL store client.
//!
//! Implements the store capability traits over a shared connection pool.
//! The terminal-status write and the resource-version-guarded upsert both
//! push their invariants into SQL so that concurrently executing workers
//! cannot violate them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::models::{
    Deployment, DeploymentRequest, DeploymentStatus, RequestStatus, RequestType, User,
};
use super::{DeploymentStore, RequestStore, UserStore};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(sqlx::Error),

    /// A unique constraint rejected the write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 23505 = unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::UniqueViolation(db_err.message().to_string());
            }
        }
        StoreError::QueryFailed(err)
    }
}

impl StoreError {
    /// Returns true when the error is a unique-constraint rejection.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

/// PostgreSQL store client.
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database and returns a new client.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a new store client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }
}

// =============================================================================
// Row decoding
// =============================================================================

fn request_from_row(row: &sqlx::postgres::PgRow) -> Result<DeploymentRequest, StoreError> {
    let request_type_raw: String = row.get("request_type");
    let status_raw: String = row.get("status");

    let request_type = RequestType::parse(&request_type_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("request_type '{}'", request_type_raw)))?;
    let status = RequestStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("request status '{}'", status_raw)))?;

    Ok(DeploymentRequest {
        id: row.get("id"),
        request_id: row.get("request_id"),
        identifier: row.get("identifier"),
        name: row.get("name"),
        namespace: row.get("namespace"),
        request_type,
        status,
        image: row.get("image"),
        user_id: row.get("user_id"),
        metadata: row.get("metadata"),
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn deployment_from_row(row: &sqlx::postgres::PgRow) -> Result<Deployment, StoreError> {
    let status_raw: String = row.get("status");
    let status = DeploymentStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("deployment status '{}'", status_raw)))?;

    Ok(Deployment {
        id: row.get("id"),
        identifier: row.get("identifier"),
        name: row.get("name"),
        namespace: row.get("namespace"),
        image: row.get("image"),
        status,
        user_id: row.get("user_id"),
        resource_version: row.get("resource_version"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// =============================================================================
// Request operations
// =============================================================================

#[async_trait]
impl RequestStore for Database {
    async fn create_request(&self, request: &DeploymentRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deployment_requests (
                id, request_id, identifier, name, namespace, request_type,
                status, image, user_id, metadata, failure_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(request.id)
        .bind(&request.request_id)
        .bind(&request.identifier)
        .bind(&request.name)
        .bind(&request.namespace)
        .bind(request.request_type.as_str())
        .bind(request.status.as_str())
        .bind(&request.image)
        .bind(request.user_id)
        .bind(&request.metadata)
        .bind(&request.failure_reason)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_request_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<DeploymentRequest>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, request_id, identifier, name, namespace, request_type,
                   status, image, user_id, metadata, failure_reason, created_at, updated_at
            FROM deployment_requests
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(request_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_requests_by_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DeploymentRequest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, identifier, name, namespace, request_type,
                   status, image, user_id, metadata, failure_reason, created_at, updated_at
            FROM deployment_requests
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            requests.push(request_from_row(&row)?);
        }
        Ok(requests)
    }

    async fn update_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
        failure_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        // The WHERE clause guards the state machine: a terminal status is only
        // ever written over CREATED, so redeliveries cannot overwrite it.
        sqlx::query(
            r#"
            UPDATE deployment_requests
            SET status = $2, failure_reason = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'CREATED'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Deployment operations
// =============================================================================

#[async_trait]
impl DeploymentStore for Database {
    async fn get_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, identifier, name, namespace, image, status, user_id,
                   resource_version, metadata, created_at, updated_at
            FROM deployments
            WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(deployment_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn get_live_by_name_namespace(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, identifier, name, namespace, image, status, user_id,
                   resource_version, metadata, created_at, updated_at
            FROM deployments
            WHERE name = $1 AND namespace = $2 AND status <> 'DELETED'
            "#,
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(deployment_from_row(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Deployment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, identifier, name, namespace, image, status, user_id,
                   resource_version, metadata, created_at, updated_at
            FROM deployments
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut deployments = Vec::with_capacity(rows.len());
        for row in rows {
            deployments.push(deployment_from_row(&row)?);
        }
        Ok(deployments)
    }

    async fn update(&self, deployment: &Deployment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET name = $2, namespace = $3, image = $4, status = $5,
                resource_version = $6, metadata = $7, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(deployment.id)
        .bind(&deployment.name)
        .bind(&deployment.namespace)
        .bind(&deployment.image)
        .bind(deployment.status.as_str())
        .bind(&deployment.resource_version)
        .bind(&deployment.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert(&self, deployment: &Deployment) -> Result<(), StoreError> {
        // Keyed by identifier; the resource_version equality guard in the
        // WHERE clause skips replayed change notifications (resync storms).
        // created_at is preserved on update.
        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, identifier, name, namespace, image, status, user_id,
                resource_version, metadata, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (identifier) DO UPDATE SET
                name = EXCLUDED.name,
                namespace = EXCLUDED.namespace,
                image = EXCLUDED.image,
                status = EXCLUDED.status,
                user_id = EXCLUDED.user_id,
                resource_version = EXCLUDED.resource_version,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            WHERE deployments.resource_version <> EXCLUDED.resource_version
            "#,
        )
        .bind(deployment.id)
        .bind(&deployment.identifier)
        .bind(&deployment.name)
        .bind(&deployment.namespace)
        .bind(&deployment.image)
        .bind(deployment.status.as_str())
        .bind(deployment.user_id)
        .bind(&deployment.resource_version)
        .bind(&deployment.metadata)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// User operations
// =============================================================================

#[async_trait]
impl UserStore for Database {
    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, created_at
            FROM users
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let created_at: DateTime<Utc> = r.get("created_at");
                Ok(Some(User {
                    id: r.get("id"),
                    external_id: r.get("external_id"),
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, external_id, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user.id)
        .bind(&user.external_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
