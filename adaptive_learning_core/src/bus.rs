//! Message bus abstraction: pub/sub channels plus a durable-style job queue.
//!
//! The core only depends on the [`MessageBus`] trait. [`InMemoryBus`] backs
//! each channel with a `tokio::sync::broadcast` sender and each queue with a
//! FIFO, which is enough for a single process and for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Shared channel every agent may subscribe to for broadcasts.
pub const EVENTS_CHANNEL: &str = "agent:events";

/// Queue carrying `execute-step` audit jobs.
pub const EXECUTE_STEP_QUEUE: &str = "execute-step";

pub fn inbound_channel(agent_id: &str) -> String {
    format!("agent:{agent_id}:messages")
}

pub fn response_channel(agent_id: &str) -> String {
    format!("agent:{agent_id}:responses")
}

/// Wire format for agent-to-agent traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub from_agent: String,
    pub to_agent: String,
    pub timestamp: DateTime<Utc>,
    pub message: Value,
}

impl Envelope {
    pub fn new(from_agent: &str, to_agent: &str, message: Value) -> Self {
        Self {
            correlation_id: None,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Fire-and-forget event published on [`EVENTS_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub from_agent: String,
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// A job sitting on a named queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: String,
    pub job_type: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(job_type: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Receiving end of a channel subscription. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Value>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the channel is closed. Lagged messages
    /// are skipped with a warning.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber on '{}' lagged, skipped {} messages", self.channel, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish to a channel, returning the number of live subscribers.
    async fn publish(&self, channel: &str, message: Value) -> CoreResult<usize>;

    async fn subscribe(&self, channel: &str) -> CoreResult<Subscription>;

    async fn enqueue(&self, queue: &str, job: QueuedJob) -> CoreResult<()>;

    async fn consume(&self, queue: &str) -> CoreResult<Option<QueuedJob>>;

    async fn queue_len(&self, queue: &str) -> CoreResult<usize>;
}

/// In-process bus for single-node deployments and tests.
pub struct InMemoryBus {
    channels: DashMap<String, broadcast::Sender<Value>>,
    queues: Mutex<HashMap<String, VecDeque<QueuedJob>>>,
    channel_capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1_024)
    }

    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    #[instrument(skip(self, message))]
    async fn publish(&self, channel: &str, message: Value) -> CoreResult<usize> {
        // A send with no receivers is not an error for pub/sub semantics.
        let delivered = self.sender(channel).send(message).unwrap_or(0);
        debug!("Published to '{}' ({} subscribers)", channel, delivered);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> CoreResult<Subscription> {
        Ok(Subscription {
            channel: channel.to_string(),
            receiver: self.sender(channel).subscribe(),
        })
    }

    async fn enqueue(&self, queue: &str, job: QueuedJob) -> CoreResult<()> {
        if job.job_type.is_empty() {
            return Err(CoreError::Bus("job type cannot be empty".to_string()));
        }
        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(job);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> CoreResult<Option<QueuedJob>> {
        Ok(self
            .queues
            .lock()
            .get_mut(queue)
            .and_then(|jobs| jobs.pop_front()))
    }

    async fn queue_len(&self, queue: &str) -> CoreResult<usize> {
        Ok(self.queues.lock().get(queue).map_or(0, |jobs| jobs.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_names() {
        assert_eq!(inbound_channel("tutor"), "agent:tutor:messages");
        assert_eq!(response_channel("tutor"), "agent:tutor:responses");
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("topic").await.unwrap();
        let mut b = bus.subscribe("topic").await.unwrap();

        let delivered = bus.publish("topic", json!({"n": 1})).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(b.recv().await.unwrap(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InMemoryBus::new();
        assert_eq!(bus.publish("empty", json!(null)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("topic").await.unwrap();
        assert_eq!(bus.subscriber_count("topic"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("topic"), 0);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let bus = InMemoryBus::new();
        bus.enqueue(EXECUTE_STEP_QUEUE, QueuedJob::new("execute-step", json!(1)))
            .await
            .unwrap();
        bus.enqueue(EXECUTE_STEP_QUEUE, QueuedJob::new("execute-step", json!(2)))
            .await
            .unwrap();

        assert_eq!(bus.queue_len(EXECUTE_STEP_QUEUE).await.unwrap(), 2);
        let first = bus.consume(EXECUTE_STEP_QUEUE).await.unwrap().unwrap();
        assert_eq!(first.payload, json!(1));
        let second = bus.consume(EXECUTE_STEP_QUEUE).await.unwrap().unwrap();
        assert_eq!(second.payload, json!(2));
        assert!(bus.consume(EXECUTE_STEP_QUEUE).await.unwrap().is_none());
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new("a", "b", json!("hi")).with_correlation_id("c-1");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["correlationId"], "c-1");
        assert_eq!(value["fromAgent"], "a");
        assert_eq!(value["toAgent"], "b");
    }
}
