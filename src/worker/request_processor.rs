//! Request processor: drives accepted requests to a terminal status.
//!
//! Terminal status rules: SUCCESS after the cluster operation lands, FAILURE
//! on a permanent error or when the final attempt fails. The store's guard
//! makes the terminal write first-wins, so a redelivered message can never
//! flip an outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterApi, ClusterError};
use crate::queue::{HandlerOutcome, MessageContext, MessageHandler, RequestMessage};
use crate::store::models::{DeploymentRequest, RequestStatus, RequestType};
use crate::store::RequestStore;

pub struct RequestProcessor {
    requests: Arc<dyn RequestStore>,
    cluster: Arc<dyn ClusterApi>,
}

impl RequestProcessor {
    pub fn new(requests: Arc<dyn RequestStore>, cluster: Arc<dyn ClusterApi>) -> Self {
        Self { requests, cluster }
    }

    async fn dispatch(&self, request: &DeploymentRequest) -> Result<(), ClusterError> {
        match request.request_type {
            RequestType::Create => {
                self.cluster.create(request).await?;
                Ok(())
            }
            RequestType::Update => {
                let existing = self
                    .cluster
                    .get_optional(&request.namespace, &request.identifier)
                    .await?;
                match existing {
                    Some(workload) => {
                        self.cluster.update(request, workload).await?;
                        Ok(())
                    }
                    None => Err(ClusterError::Manifest(format!(
                        "workload '{}' not found in namespace '{}'",
                        request.identifier, request.namespace
                    ))),
                }
            }
            RequestType::Delete => {
                self.cluster
                    .delete(&request.namespace, &request.identifier)
                    .await
            }
        }
    }

    /// Writes the FAILURE terminal status. Logged but not surfaced: the
    /// delivery outcome is decided by the cluster error, not by this write.
    async fn mark_failed(&self, request: &DeploymentRequest, reason: &str) {
        if let Err(e) = self
            .requests
            .update_request_status(request.id, RequestStatus::Failure, Some(reason))
            .await
        {
            error!(
                request_id = %request.request_id,
                error = %e,
                "failed to write FAILURE status"
            );
        }
    }
}

#[async_trait]
impl MessageHandler for RequestProcessor {
    async fn handle(&self, payload: &str, ctx: &MessageContext) -> HandlerOutcome {
        let message: RequestMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                return HandlerOutcome::PermanentFailure(format!("unparseable payload: {}", e));
            }
        };

        let request = match self
            .requests
            .get_request_by_request_id(&message.request_id)
            .await
        {
            Ok(Some(request)) => request,
            // The row is written before the message, so absence is
            // usually replication lag; let the retry loop decide
            Ok(None) => {
                return HandlerOutcome::RetryableFailure(format!(
                    "request '{}' not found",
                    message.request_id
                ));
            }
            Err(e) => return HandlerOutcome::RetryableFailure(e.to_string()),
        };

        if request.status != RequestStatus::Created {
            info!(
                request_id = %request.request_id,
                status = %request.status.as_str(),
                "request already settled, acknowledging redelivery"
            );
            return HandlerOutcome::Success;
        }

        let header_user = ctx
            .user_id
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok());
        if header_user != Some(request.user_id) {
            // Deliberately no terminal write: a forged or corrupted header
            // must not be able to fail someone else's request
            return HandlerOutcome::PermanentFailure(format!(
                "header user does not own request '{}'",
                request.request_id
            ));
        }

        match self.dispatch(&request).await {
            Ok(()) => {
                if let Err(e) = self
                    .requests
                    .update_request_status(request.id, RequestStatus::Success, None)
                    .await
                {
                    return HandlerOutcome::RetryableFailure(format!(
                        "cluster operation applied but status write failed: {}",
                        e
                    ));
                }
                info!(
                    request_id = %request.request_id,
                    identifier = %request.identifier,
                    request_type = %request.request_type.as_str(),
                    "request completed"
                );
                HandlerOutcome::Success
            }
            Err(e) if e.is_permanent() => {
                let reason = e.to_string();
                self.mark_failed(&request, &reason).await;
                HandlerOutcome::PermanentFailure(reason)
            }
            Err(e) => {
                let reason = e.to_string();
                if ctx.final_attempt {
                    self.mark_failed(&request, &reason).await;
                } else {
                    warn!(
                        request_id = %request.request_id,
                        attempt = ctx.attempt,
                        error = %reason,
                        "cluster operation failed, will retry"
                    );
                }
                HandlerOutcome::RetryableFailure(reason)
            }
        }
    }
}
