//! Cross-instance relay over a pub/sub broker.
//!
//! Every instance publishes the events it dispatches locally and subscribes
//! to all chat channels. Received envelopes are delivered to local sessions
//! only and are never published again. Envelopes carry the publishing
//! instance so it can skip its own echoes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use messenger_common::{ChatId, UserId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time;

use super::dispatcher::{DispatchReport, Dispatcher};

/// Publish attempts longer than this are abandoned.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause before resubscribing after the subscription drops.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Deterministic channel names.
pub mod channel {
    use messenger_common::{ChatId, UserId};

    /// Channel for events addressed to single users by other publishers.
    pub const GLOBAL: &str = "chat:global";

    /// Patterns covering every chat-scoped channel.
    pub const PATTERNS: [&str; 2] = ["chat:group:*", "chat:private:*"];

    pub fn group(chat_id: ChatId) -> String {
        format!("chat:group:{chat_id}")
    }

    /// Direct-chat channel; both participants map to the same name.
    pub fn private(a: UserId, b: UserId) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("chat:private:{lo}:{hi}")
    }
}

/// Who a relayed event is for, resolved by the receiving instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RecipientHint {
    User(UserId),
    Chat(ChatId),
}

/// Unit of cross-instance transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub recipient: RecipientHint,
    pub sender_id: UserId,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl RelayEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        recipient: RecipientHint,
        sender_id: UserId,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            recipient,
            sender_id,
            payload,
            origin: None,
        }
    }
}

/// One message received from the broker.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broker operation timed out")]
    Timeout,
}

/// Minimal pub/sub surface the relay needs.
#[async_trait]
pub trait PubSubBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError>;

    /// Subscribe to glob `patterns` and exact `channels`. The stream ends when
    /// the underlying connection is lost.
    async fn subscribe(
        &self,
        patterns: &[&str],
        channels: &[&str],
    ) -> Result<BoxStream<'static, RelayMessage>, RelayError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBroker {
    /// Connect and verify the broker is reachable.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl PubSubBroker for RedisBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[&str],
        channels: &[&str],
    ) -> Result<BoxStream<'static, RelayMessage>, RelayError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(*pattern).await?;
        }
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }

        let messages = pubsub.into_on_message().map(|msg| RelayMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        });
        Ok(messages.boxed())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests / single process)
// ---------------------------------------------------------------------------

/// Capacity of the in-process bus. Lagging subscribers skip messages.
const MEMORY_BUS_CAPACITY: usize = 1024;

pub struct MemoryBroker {
    bus: broadcast::Sender<RelayMessage>,
    published: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self {
            bus,
            published: AtomicUsize::new(0),
        }
    }

    /// Total messages published so far.
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.receiver_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Redis-style matching: a trailing `*` matches any suffix.
fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl PubSubBroker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // No subscribers is not an error.
        let _ = self.bus.send(RelayMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[&str],
        channels: &[&str],
    ) -> Result<BoxStream<'static, RelayMessage>, RelayError> {
        let filters: Arc<Vec<String>> = Arc::new(
            patterns
                .iter()
                .chain(channels.iter())
                .map(|s| s.to_string())
                .collect(),
        );
        let rx = self.bus.subscribe();

        let messages = stream::unfold(rx, move |mut rx| {
            let filters = filters.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) if filters.iter().any(|f| channel_matches(f, &msg.channel)) => {
                            return Some((msg, rx));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(messages.boxed())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// The relay half owned by one gateway instance.
pub struct Relay {
    broker: Arc<dyn PubSubBroker>,
    instance_id: String,
}

impl Relay {
    pub fn new(broker: Arc<dyn PubSubBroker>, instance_id: impl Into<String>) -> Self {
        Self {
            broker,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Publish a locally originated event. Failures are logged and
    /// swallowed; local delivery has already happened.
    pub async fn publish(&self, channel: &str, mut envelope: RelayEnvelope) {
        envelope.origin = Some(self.instance_id.clone());

        let result = match serde_json::to_vec(&envelope) {
            Ok(bytes) => time::timeout(PUBLISH_TIMEOUT, self.broker.publish(channel, bytes))
                .await
                .unwrap_or(Err(RelayError::Timeout)),
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(()) => tracing::debug!(%channel, event = %envelope.event_type, "relayed event"),
            Err(err) => tracing::warn!(?err, %channel, "relay publish failed"),
        }
    }

    /// Handle one broker message. Returns `None` when the message is dropped
    /// (own echo, undecodable, or failed resolution).
    pub async fn receive(
        &self,
        dispatcher: &Dispatcher,
        message: RelayMessage,
    ) -> Option<DispatchReport> {
        let envelope: RelayEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    ?err,
                    channel = %message.channel,
                    "dropping undecodable relay message"
                );
                return None;
            }
        };

        if envelope.origin.as_deref() == Some(self.instance_id.as_str()) {
            return None;
        }

        match dispatcher.deliver_relayed(&envelope).await {
            Ok(report) => {
                tracing::debug!(
                    channel = %message.channel,
                    event = %envelope.event_type,
                    delivered = report.delivered,
                    "delivered relayed event"
                );
                Some(report)
            }
            Err(err) => {
                tracing::warn!(
                    ?err,
                    channel = %message.channel,
                    "failed to deliver relayed event"
                );
                None
            }
        }
    }

    /// Subscription loop. Resubscribes after a short pause whenever the
    /// broker connection drops. Runs until the task is aborted.
    pub async fn run_subscriber(self: Arc<Self>, dispatcher: Arc<Dispatcher>) {
        loop {
            match self.broker.subscribe(&channel::PATTERNS, &[channel::GLOBAL]).await {
                Ok(mut messages) => {
                    tracing::info!(instance_id = %self.instance_id, "relay subscribed");
                    while let Some(message) = messages.next().await {
                        self.receive(&dispatcher, message).await;
                    }
                    tracing::warn!("relay subscription ended, resubscribing");
                }
                Err(err) => {
                    tracing::warn!(?err, "relay subscribe failed, retrying");
                }
            }
            time::sleep(RESUBSCRIBE_BACKOFF).await;
        }
    }

    pub fn spawn_subscriber(
        self: &Arc<Self>,
        dispatcher: Arc<Dispatcher>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run_subscriber(dispatcher))
    }
}
