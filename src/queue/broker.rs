//! Redis stream broker: producers and low-level consumer-group operations.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::debug;

use super::message::{RequestMessage, UpdateMessage};
use super::{QueueError, RequestPublisher, UpdatePublisher};

/// A message as read off a stream, headers split out of the field map.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Stream entry id, used for acknowledgement.
    pub id: String,
    /// Stream the entry was read from.
    pub channel: String,
    /// JSON payload.
    pub payload: String,
    /// Request correlation header, when the producer set one.
    pub request_id: Option<String>,
    /// Owner identity header, when the producer set one.
    pub user_id: Option<String>,
}

impl MessageEnvelope {
    fn from_entry(channel: &str, entry: &StreamId) -> Result<Self, QueueError> {
        let payload: String = entry
            .get("payload")
            .ok_or_else(|| QueueError::MalformedEnvelope(channel.to_string()))?;

        Ok(Self {
            id: entry.id.clone(),
            channel: channel.to_string(),
            payload,
            request_id: entry.get("request_id"),
            user_id: entry.get("user_id"),
        })
    }
}

/// Redis stream broker.
///
/// Holds a [`ConnectionManager`] so clones share one multiplexed connection
/// and reconnection is handled transparently.
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
    request_channel: String,
    update_channel: String,
}

impl RedisBroker {
    /// Connects to Redis and creates a new broker.
    pub async fn connect(
        redis_url: &str,
        request_channel: &str,
        update_channel: &str,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, request_channel, update_channel))
    }

    /// Creates a broker from an existing connection manager.
    pub fn from_connection(
        redis: ConnectionManager,
        request_channel: &str,
        update_channel: &str,
    ) -> Self {
        Self {
            redis,
            request_channel: request_channel.to_string(),
            update_channel: update_channel.to_string(),
        }
    }

    /// Returns the request channel name.
    pub fn request_channel(&self) -> &str {
        &self.request_channel
    }

    /// Returns the update channel name.
    pub fn update_channel(&self) -> &str {
        &self.update_channel
    }

    /// Name of the dead-letter stream paired with a channel.
    pub fn dead_letter_channel(channel: &str) -> String {
        format!("{}:dead_letter", channel)
    }

    async fn append(
        &self,
        channel: &str,
        fields: &[(&str, String)],
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.xadd::<_, _, _, _, ()>(channel, "*", fields).await?;
        Ok(())
    }

    /// Creates the consumer group for a channel, creating the stream if it
    /// does not exist yet. An already existing group is not an error.
    pub async fn ensure_group(&self, channel: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let result: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(channel, group, "0").await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::RedisError(e)),
        }
    }

    /// Reads up to `count` new messages for this consumer, blocking up to
    /// `block_ms` when the stream is idle.
    pub async fn read_new(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<MessageEnvelope>, QueueError> {
        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);

        // ">" asks for entries never delivered to this group
        let reply: StreamReadReply = conn.xread_options(&[channel], &[">"], &options).await?;

        let mut envelopes = Vec::new();
        for key in &reply.keys {
            for entry in &key.ids {
                envelopes.push(MessageEnvelope::from_entry(channel, entry)?);
            }
        }
        Ok(envelopes)
    }

    /// Acknowledges a delivered message.
    pub async fn ack(&self, channel: &str, group: &str, id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.xack::<_, _, _, ()>(channel, group, &[id]).await?;
        Ok(())
    }

    /// Claims entries left pending by consumers that died mid-flight.
    ///
    /// Called on startup so deliveries interrupted by a crash are re-run
    /// rather than stranded in the group's pending list forever.
    pub async fn claim_stale(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: usize,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, QueueError> {
        let mut conn = self.redis.clone();

        let pending: StreamPendingCountReply = conn
            .xpending_count(channel, group, "-", "+", count)
            .await?;

        let stale_ids: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id.clone())
            .collect();

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        debug!(channel, count = stale_ids.len(), "claiming stale pending entries");

        let claimed: redis::streams::StreamClaimReply = conn
            .xclaim(channel, group, consumer, min_idle_ms, &stale_ids)
            .await?;

        let mut envelopes = Vec::new();
        for entry in &claimed.ids {
            envelopes.push(MessageEnvelope::from_entry(channel, entry)?);
        }
        Ok(envelopes)
    }

    /// Moves an exhausted message to the channel's dead-letter stream.
    pub async fn dead_letter(
        &self,
        envelope: &MessageEnvelope,
        error: &str,
    ) -> Result<(), QueueError> {
        let dead_channel = Self::dead_letter_channel(&envelope.channel);
        let mut fields = vec![
            ("payload", envelope.payload.clone()),
            ("error", error.to_string()),
            ("moved_at", chrono::Utc::now().to_rfc3339()),
        ];
        if let Some(request_id) = &envelope.request_id {
            fields.push(("request_id", request_id.clone()));
        }
        if let Some(user_id) = &envelope.user_id {
            fields.push(("user_id", user_id.clone()));
        }
        self.append(&dead_channel, &fields).await
    }
}

#[async_trait]
impl RequestPublisher for RedisBroker {
    async fn publish_request(&self, message: &RequestMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        let fields = [
            ("payload", payload),
            ("request_id", message.request_id.clone()),
            ("user_id", message.user_id.to_string()),
        ];
        self.append(&self.request_channel, &fields).await
    }
}

#[async_trait]
impl UpdatePublisher for RedisBroker {
    async fn publish_update(&self, message: &UpdateMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        let fields = [("payload", payload)];
        self.append(&self.update_channel, &fields).await
    }
}
