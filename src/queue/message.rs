//! Wire types carried over the queue channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification that a deployment request row is waiting to be processed.
///
/// The payload is deliberately a pointer, not a copy: workers re-read the row
/// from the store so that redeliveries always see the current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestMessage {
    /// Client-supplied idempotency key of the persisted request row.
    pub request_id: String,
    /// Owner of the request, echoed into the envelope headers so handlers
    /// can verify ownership without a payload parse.
    pub user_id: Uuid,
}

impl RequestMessage {
    pub fn new(request_id: impl Into<String>, user_id: Uuid) -> Self {
        Self {
            request_id: request_id.into(),
            user_id,
        }
    }
}

/// The kind of change observed on a cluster resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    /// The resource was created or modified.
    Modified,
    /// The resource was removed from the cluster.
    Deleted,
}

impl ChangeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEventType::Modified => "MODIFIED",
            ChangeEventType::Deleted => "DELETED",
        }
    }
}

/// Notification that a managed cluster resource changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateMessage {
    /// Qualified workload identifier in `namespace/name` form.
    pub identifier: String,
    /// What happened to the resource.
    pub event_type: ChangeEventType,
}

impl UpdateMessage {
    pub fn new(namespace: &str, name: &str, event_type: ChangeEventType) -> Self {
        Self {
            identifier: format!("{}/{}", namespace, name),
            event_type,
        }
    }

    /// Splits the qualified identifier into (namespace, name).
    ///
    /// Returns `None` when either side of the separator is empty.
    pub fn split_identifier(&self) -> Option<(&str, &str)> {
        let (namespace, name) = self.identifier.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some((namespace, name))
    }
}
