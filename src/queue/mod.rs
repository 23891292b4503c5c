//! Message queue: durable delivery of deployment requests and change events.
//!
//! Built on Redis streams with consumer groups. Producers append envelopes to
//! a stream; the consumer runtime reads them through a shared group so each
//! message is delivered to exactly one worker, retried within a shared
//! deadline, and acknowledged exactly once. Messages that exhaust their
//! attempts land in a `{channel}:dead_letter` stream for inspection.

mod broker;
mod consumer;
mod message;

pub use broker::{MessageEnvelope, RedisBroker};
pub use consumer::{
    ConsumerRuntime, HandlerOutcome, MessageContext, MessageHandler, RouteOptions,
};
pub use message::{ChangeEventType, RequestMessage, UpdateMessage};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a message payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A stream entry was missing its payload field.
    #[error("Malformed envelope in stream '{0}': missing payload")]
    MalformedEnvelope(String),

    /// The runtime is already running.
    #[error("Consumer runtime is already running")]
    AlreadyRunning,

    /// Graceful shutdown did not drain in-flight messages in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Producer side of the request channel.
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    /// Publishes a deployment request notification for worker pickup.
    async fn publish_request(&self, message: &RequestMessage) -> Result<(), QueueError>;
}

/// Producer side of the update channel.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    /// Publishes a cluster change notification for reconciliation.
    async fn publish_update(&self, message: &UpdateMessage) -> Result<(), QueueError>;
}
