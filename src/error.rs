//! Error types for the request intake layer.
//!
//! Worker-side subsystems define their own error enums next to their code
//! (`StoreError`, `QueueError`, `ClusterError`); this module holds the errors
//! that are returned synchronously to the caller of the intake operations.

use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

/// Errors returned by the intake operations.
///
/// Ownership mismatches are deliberately reported as [`IntakeError::NotFound`]
/// so that a caller probing another user's resources cannot distinguish
/// "exists but not yours" from "does not exist".
#[derive(Debug, Error)]
pub enum IntakeError {
    /// Malformed input, rejected before anything is persisted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A deployment request with this request_id already exists.
    #[error("Deployment request '{0}' already exists")]
    DuplicateRequest(String),

    /// A live deployment already occupies this (name, namespace) pair.
    #[error("Deployment with name '{name}' and namespace '{namespace}' already exists")]
    AlreadyExists { name: String, namespace: String },

    /// The target deployment has been deleted and can no longer be changed.
    #[error("Deployment '{0}' is deleted")]
    AlreadyDeleted(String),

    /// Unknown entity, or an entity owned by a different user.
    #[error("{0} not found")]
    NotFound(String),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Publishing the work item failed after the request row was persisted.
    /// The row stays in CREATED with no automatic re-publish.
    #[error("Failed to publish work item: {0}")]
    Publish(#[from] QueueError),
}
