//! Queue abstraction between the engine, executors and subscribers.
//!
//! Four logical channels are carried:
//! - work: engine → executor (work requests)
//! - results: executor → engine (step results, also synthesized ones)
//! - deployments: deployment watcher → engine (deployment outcomes)
//! - notifications: engine → anyone, fire-and-forget
//!
//! Delivery is at-least-once. Consumers settle each delivery with a
//! [`Disposition`].

pub mod consumer;
pub mod memory;
pub mod nats;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AppError, AppResult};

pub use consumer::{run_consumer, MessageHandler};
pub use memory::MemoryQueue;
pub use nats::NatsQueue;

/// Logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Work,
    Results,
    Deployments,
    Notifications,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Work => "work",
            Channel::Results => "results",
            Channel::Deployments => "deployments",
            Channel::Notifications => "notifications",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a consumed message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed (or deliberately ignored).
    Ack,
    /// Transient failure, redeliver later.
    Retry,
    /// Never redeliver.
    Reject,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, disposition: Disposition) -> AppResult<()>;
}

/// One consumed message.
pub struct Delivery {
    pub channel: Channel,
    pub payload: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(channel: Channel, payload: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self {
            channel,
            payload,
            acker,
        }
    }

    pub async fn settle(&self, disposition: Disposition) -> AppResult<()> {
        self.acker.settle(disposition).await
    }
}

/// Publish/subscribe client injected into the store, gateway and runner.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> AppResult<()>;

    /// Stream of deliveries for one consumable channel.
    async fn subscribe(&self, channel: Channel) -> AppResult<BoxStream<'static, Delivery>>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    queue: &dyn QueueClient,
    channel: Channel,
    message: &T,
) -> AppResult<()> {
    let payload = serde_json::to_vec(message)?;
    queue.publish(channel, payload).await
}

/// Decode a JSON payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> AppResult<T> {
    serde_json::from_slice(payload).map_err(AppError::from)
}
