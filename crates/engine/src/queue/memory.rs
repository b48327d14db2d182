//! In-process queue used when no NATS server is configured, and in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{Mutex, Notify};

use crate::error::AppResult;

use super::{Acker, Channel, Delivery, Disposition, QueueClient};

#[derive(Default)]
struct Inner {
    pending: HashMap<Channel, VecDeque<Vec<u8>>>,
    published: Vec<(Channel, Vec<u8>)>,
    rejected: Vec<(Channel, Vec<u8>)>,
}

/// Queue keeping one FIFO per channel plus a log of everything published.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
    signals: Arc<std::sync::Mutex<HashMap<Channel, Arc<Notify>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, channel: Channel) -> Arc<Notify> {
        let mut signals = self
            .signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        signals
            .entry(channel)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Pop the oldest pending message on a channel.
    pub async fn take(&self, channel: Channel) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .await
            .pending
            .get_mut(&channel)
            .and_then(|queue| queue.pop_front())
    }

    /// Pop and decode every pending message on a channel.
    pub async fn drain<T: serde::de::DeserializeOwned>(&self, channel: Channel) -> AppResult<Vec<T>> {
        let payloads: Vec<Vec<u8>> = {
            let mut inner = self.inner.lock().await;
            inner
                .pending
                .get_mut(&channel)
                .map(|queue| queue.drain(..).collect())
                .unwrap_or_default()
        };
        payloads.iter().map(|p| super::decode(p)).collect()
    }

    pub async fn pending(&self, channel: Channel) -> usize {
        self.inner
            .lock()
            .await
            .pending
            .get(&channel)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Everything ever published on a channel, in order.
    pub async fn published(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .await
            .published
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub async fn rejected(&self) -> Vec<(Channel, Vec<u8>)> {
        self.inner.lock().await.rejected.clone()
    }

    async fn push(&self, channel: Channel, payload: Vec<u8>) {
        self.inner
            .lock()
            .await
            .pending
            .entry(channel)
            .or_default()
            .push_back(payload);
        self.signal(channel).notify_one();
    }
}

struct MemoryAcker {
    queue: MemoryQueue,
    channel: Channel,
    payload: Vec<u8>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(&self, disposition: Disposition) -> AppResult<()> {
        match disposition {
            Disposition::Ack => {}
            Disposition::Retry => self.queue.push(self.channel, self.payload.clone()).await,
            Disposition::Reject => self
                .queue
                .inner
                .lock()
                .await
                .rejected
                .push((self.channel, self.payload.clone())),
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> AppResult<()> {
        self.inner
            .lock()
            .await
            .published
            .push((channel, payload.clone()));

        // Notifications have no consumers inside the engine.
        if channel != Channel::Notifications {
            self.push(channel, payload).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> AppResult<BoxStream<'static, Delivery>> {
        let queue = self.clone();
        let signal = self.signal(channel);

        let deliveries = stream::unfold((queue, signal), move |(queue, signal)| async move {
            loop {
                if let Some(payload) = queue.take(channel).await {
                    let acker = MemoryAcker {
                        queue: queue.clone(),
                        channel,
                        payload: payload.clone(),
                    };
                    let delivery = Delivery::new(channel, payload, Box::new(acker));
                    return Some((delivery, (queue, signal)));
                }
                signal.notified().await;
            }
        });

        Ok(deliveries.boxed())
    }
}
