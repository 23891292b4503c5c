//! Row types and status enums for the relational store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of change a deployment request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl RequestType {
    /// Stable string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Create => "CREATE",
            RequestType::Update => "UPDATE",
            RequestType::Delete => "DELETE",
        }
    }

    /// Parses the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(RequestType::Create),
            "UPDATE" => Some(RequestType::Update),
            "DELETE" => Some(RequestType::Delete),
            _ => None,
        }
    }
}

/// Processing state of a deployment request.
///
/// Transitions only CREATED→SUCCESS or CREATED→FAILURE; never reversed,
/// never set twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Created,
    Success,
    Failure,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Created => "CREATED",
            RequestStatus::Success => "SUCCESS",
            RequestStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(RequestStatus::Created),
            "SUCCESS" => Some(RequestStatus::Success),
            "FAILURE" => Some(RequestStatus::Failure),
            _ => None,
        }
    }
}

/// Last-known state of a cluster workload as mirrored in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeploymentStatus {
    Initiated,
    Created,
    Updating,
    Deleted,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Initiated => "INITIATED",
            DeploymentStatus::Created => "CREATED",
            DeploymentStatus::Updating => "UPDATING",
            DeploymentStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INITIATED" => Some(DeploymentStatus::Initiated),
            "CREATED" => Some(DeploymentStatus::Created),
            "UPDATING" => Some(DeploymentStatus::Updating),
            "DELETED" => Some(DeploymentStatus::Deleted),
            _ => None,
        }
    }
}

/// CPU and memory values for one side of a resource specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
}

/// Requested and limiting resource quantities for a workload container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub request: ResourceSpec,
    pub limit: ResourceSpec,
}

/// Semi-structured metadata carried by a deployment request.
///
/// For UPDATE requests only the fields the caller supplied are present;
/// unset fields are skipped during serialization so the stored JSON carries
/// partial-patch semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limit: Option<ResourceLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_html: Option<String>,
}

impl RequestMetadata {
    /// Returns true when no field is set.
    pub fn is_empty(&self) -> bool {
        self.replica_count.is_none() && self.resource_limit.is_none() && self.doc_html.is_none()
    }
}

/// Durable record of one user-initiated change intent and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: Uuid,
    /// Client-supplied idempotency key, unique across all time.
    pub request_id: String,
    /// System-generated cluster-resource name.
    pub identifier: String,
    pub name: String,
    pub namespace: String,
    pub request_type: RequestType,
    pub status: RequestStatus,
    pub image: String,
    pub user_id: Uuid,
    /// JSONB payload; shape depends on request_type.
    pub metadata: serde_json::Value,
    /// Set only when status is FAILURE.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRequest {
    /// Decodes the metadata payload into its typed form.
    pub fn request_metadata(&self) -> Result<RequestMetadata, serde_json::Error> {
        serde_json::from_value(self.metadata.clone())
    }
}

/// Durable record mirroring the last-known state of a cluster workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    /// Cluster-resource name, unique, shared with the originating request.
    pub identifier: String,
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub status: DeploymentStatus,
    pub user_id: Uuid,
    /// Opaque version token from the cluster; compared only for equality.
    pub resource_version: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user identity, created lazily on first write-capable request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a new user row for an external identity.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            created_at: Utc::now(),
        }
    }
}
