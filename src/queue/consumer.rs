//! Consumer runtime: routes channels to handlers with retry and ack control.
//!
//! Each registered route gets a read loop pulling from its stream through the
//! shared consumer group. A delivered message is dispatched to its handler up
//! to `retry_count + 1` times under a single shared deadline, then
//! acknowledged exactly once regardless of outcome; exhausted or permanently
//! failed messages are copied to the dead-letter stream first, so nothing is
//! redelivered endlessly and nothing is lost silently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{MessageEnvelope, RedisBroker};
use super::QueueError;

/// How long to block waiting for new stream entries per read.
const READ_BLOCK_MS: usize = 5000;

/// Maximum entries fetched per read.
const READ_COUNT: usize = 10;

/// Pending entries older than this are considered abandoned on startup.
const STALE_CLAIM_MS: usize = 60_000;

/// What a handler reports back for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The message was fully processed; acknowledge it.
    Success,
    /// A transient failure; invoke the handler again if attempts remain.
    RetryableFailure(String),
    /// The message can never succeed; dead-letter it without further attempts.
    PermanentFailure(String),
}

/// Delivery metadata passed alongside the payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Request correlation header from the envelope, when present.
    pub request_id: Option<String>,
    /// Owner identity header from the envelope, when present.
    pub user_id: Option<String>,
    /// 1-based invocation number within this delivery.
    pub attempt: u32,
    /// True when no further attempts will follow this one.
    pub final_attempt: bool,
}

/// A message handler registered for one channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &str, ctx: &MessageContext) -> HandlerOutcome;
}

/// Per-route dispatch settings.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Deadline shared by all attempts of a single delivery.
    pub task_timeout: Duration,
    /// Number of re-invocations after the first attempt fails transiently.
    pub retry_count: u32,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(60),
            retry_count: 1,
        }
    }
}

impl RouteOptions {
    /// Sets the shared per-delivery deadline.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the retry count.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }
}

/// Terminal disposition of a delivery after all attempts.
#[derive(Debug, PartialEq, Eq)]
enum DispatchVerdict {
    /// Handler succeeded; plain acknowledge.
    Completed,
    /// Dead-letter with the recorded reason, then acknowledge.
    DeadLetter(String),
}

/// Runs the attempt loop for one delivery.
///
/// All attempts share one deadline: a slow first attempt eats into the time
/// available for retries. The context's `final_attempt` flag lets handlers
/// perform last-chance work such as writing a terminal failure status.
async fn run_attempts(
    handler: &dyn MessageHandler,
    envelope: &MessageEnvelope,
    options: &RouteOptions,
) -> DispatchVerdict {
    let deadline = tokio::time::Instant::now() + options.task_timeout;
    let total_attempts = options.retry_count + 1;
    let mut last_error = String::new();

    for attempt in 1..=total_attempts {
        let ctx = MessageContext {
            request_id: envelope.request_id.clone(),
            user_id: envelope.user_id.clone(),
            attempt,
            final_attempt: attempt == total_attempts,
        };

        match tokio::time::timeout_at(deadline, handler.handle(&envelope.payload, &ctx)).await {
            Ok(HandlerOutcome::Success) => return DispatchVerdict::Completed,
            Ok(HandlerOutcome::PermanentFailure(reason)) => {
                return DispatchVerdict::DeadLetter(reason);
            }
            Ok(HandlerOutcome::RetryableFailure(reason)) => {
                warn!(
                    channel = %envelope.channel,
                    entry = %envelope.id,
                    attempt,
                    reason = %reason,
                    "handler attempt failed"
                );
                last_error = reason;
            }
            Err(_) => {
                // Deadline exhausted mid-attempt; retrying cannot help.
                last_error = format!(
                    "delivery deadline of {:?} exceeded on attempt {}",
                    options.task_timeout, attempt
                );
                break;
            }
        }
    }

    DispatchVerdict::DeadLetter(last_error)
}

struct Route {
    channel: String,
    handler: Arc<dyn MessageHandler>,
    options: RouteOptions,
}

/// Consumer runtime driving all registered routes.
pub struct ConsumerRuntime {
    broker: RedisBroker,
    group: String,
    consumer_name: String,
    routes: Vec<Route>,
    shutdown_tx: broadcast::Sender<()>,
    in_flight: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ConsumerRuntime {
    /// Creates a runtime reading through the given consumer group.
    pub fn new(broker: RedisBroker, group: &str, shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            broker,
            group: group.to_string(),
            consumer_name: format!("consumer-{}", Uuid::new_v4()),
            routes: Vec::new(),
            shutdown_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            handles: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Registers a handler for a channel.
    pub fn route(
        &mut self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        options: RouteOptions,
    ) {
        self.routes.push(Route {
            channel: channel.to_string(),
            handler,
            options,
        });
    }

    /// Starts all route loops.
    ///
    /// Ensures the consumer group exists on every channel, re-dispatches
    /// entries abandoned by crashed consumers, then spawns one read loop per
    /// route. Returns once the loops are running.
    pub async fn start(&mut self) -> Result<(), QueueError> {
        if !self.handles.is_empty() {
            return Err(QueueError::AlreadyRunning);
        }

        for route in &self.routes {
            self.broker.ensure_group(&route.channel, &self.group).await?;

            let stale = self
                .broker
                .claim_stale(
                    &route.channel,
                    &self.group,
                    &self.consumer_name,
                    STALE_CLAIM_MS,
                    100,
                )
                .await?;

            if !stale.is_empty() {
                info!(
                    channel = %route.channel,
                    count = stale.len(),
                    "recovered abandoned deliveries"
                );
            }
            for envelope in stale {
                process_delivery(
                    &self.broker,
                    &self.group,
                    route.handler.as_ref(),
                    &route.options,
                    &envelope,
                )
                .await;
            }
        }

        for route in &self.routes {
            let broker = self.broker.clone();
            let group = self.group.clone();
            let consumer = self.consumer_name.clone();
            let channel = route.channel.clone();
            let handler = Arc::clone(&route.handler);
            let options = route.options.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                info!(channel = %channel, group = %group, "route loop started");
                loop {
                    let read = tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        read = broker.read_new(
                            &channel, &group, &consumer, READ_COUNT, READ_BLOCK_MS,
                        ) => read,
                    };

                    let envelopes = match read {
                        Ok(envelopes) => envelopes,
                        Err(e) => {
                            error!(channel = %channel, error = %e, "stream read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };

                    for envelope in envelopes {
                        let broker = broker.clone();
                        let group = group.clone();
                        let handler = Arc::clone(&handler);
                        let options = options.clone();
                        let in_flight = Arc::clone(&in_flight);

                        in_flight.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            process_delivery(
                                &broker,
                                &group,
                                handler.as_ref(),
                                &options,
                                &envelope,
                            )
                            .await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                }
                info!(channel = %channel, "route loop stopped");
            });

            self.handles.push(handle);
        }

        Ok(())
    }

    /// Stops the read loops and waits for in-flight deliveries to drain.
    pub async fn shutdown(&mut self) -> Result<(), QueueError> {
        info!("consumer runtime shutting down");
        // No receivers just means no loop ever started
        let _ = self.shutdown_tx.send(());

        let handles = std::mem::take(&mut self.handles);
        let in_flight = Arc::clone(&self.in_flight);

        let drained = tokio::time::timeout(self.shutdown_timeout, async move {
            for handle in handles {
                let _ = handle.await;
            }
            while in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                info!("consumer runtime stopped");
                Ok(())
            }
            Err(_) => Err(QueueError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }
}

/// Settlement side of the broker: where exhausted deliveries go and how
/// deliveries leave the pending list.
#[async_trait]
trait DeliverySettler: Send + Sync {
    async fn dead_letter(&self, envelope: &MessageEnvelope, error: &str)
        -> Result<(), QueueError>;
    async fn ack(&self, channel: &str, group: &str, id: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl DeliverySettler for RedisBroker {
    async fn dead_letter(
        &self,
        envelope: &MessageEnvelope,
        error: &str,
    ) -> Result<(), QueueError> {
        RedisBroker::dead_letter(self, envelope, error).await
    }

    async fn ack(&self, channel: &str, group: &str, id: &str) -> Result<(), QueueError> {
        RedisBroker::ack(self, channel, group, id).await
    }
}

/// Dispatches one delivery and settles it: at most one dead-letter write,
/// exactly one acknowledgement attempt.
async fn process_delivery(
    settler: &dyn DeliverySettler,
    group: &str,
    handler: &dyn MessageHandler,
    options: &RouteOptions,
    envelope: &MessageEnvelope,
) {
    debug!(channel = %envelope.channel, entry = %envelope.id, "dispatching delivery");

    match run_attempts(handler, envelope, options).await {
        DispatchVerdict::Completed => {}
        DispatchVerdict::DeadLetter(reason) => {
            error!(
                channel = %envelope.channel,
                entry = %envelope.id,
                reason = %reason,
                "delivery exhausted, dead-lettering"
            );
            if let Err(e) = settler.dead_letter(envelope, &reason).await {
                error!(entry = %envelope.id, error = %e, "dead-letter write failed");
            }
        }
    }

    // Ack unconditionally: a message that exhausted its attempts has been
    // dead-lettered and must not circle back through the group.
    if let Err(e) = settler.ack(&envelope.channel, group, &envelope.id).await {
        error!(entry = %envelope.id, error = %e, "acknowledgement failed");
    }
}
