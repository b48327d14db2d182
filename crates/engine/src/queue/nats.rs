//! NATS implementation of the queue client.
//!
//! Work, result and deployment subjects live in one JetStream stream,
//! declared if absent. Each consumed channel gets its own durable pull
//! consumer. Run notifications go out as core NATS publishes.

use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, AckKind, Context};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

use super::{Acker, Channel, Delivery, Disposition, QueueClient};

/// Subjects and names used on the broker.
#[derive(Debug, Clone)]
pub struct NatsTopology {
    pub stream: String,
    pub consumer: String,
    pub work_subject: String,
    pub result_subject: String,
    pub deployment_subject: String,
    pub notification_subject: String,
}

impl NatsTopology {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream: config.nats_stream.clone(),
            consumer: config.nats_consumer.clone(),
            work_subject: config.work_subject.clone(),
            result_subject: config.result_subject.clone(),
            deployment_subject: config.deployment_subject.clone(),
            notification_subject: config.notification_subject.clone(),
        }
    }

    pub fn subject(&self, channel: Channel) -> &str {
        match channel {
            Channel::Work => &self.work_subject,
            Channel::Results => &self.result_subject,
            Channel::Deployments => &self.deployment_subject,
            Channel::Notifications => &self.notification_subject,
        }
    }

    /// Durable consumer name for a channel.
    pub fn durable_name(&self, channel: Channel) -> String {
        format!("{}-{}", self.consumer, channel.as_str())
    }

    fn stream_subjects(&self) -> Vec<String> {
        vec![
            self.work_subject.clone(),
            self.result_subject.clone(),
            self.deployment_subject.clone(),
        ]
    }
}

/// JetStream-backed queue client.
#[derive(Clone)]
pub struct NatsQueue {
    client: async_nats::Client,
    js: Context,
    topology: NatsTopology,
}

impl NatsQueue {
    /// Connect and make sure the stream exists.
    pub async fn connect(nats_url: &str, topology: NatsTopology) -> AppResult<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| AppError::Queue(format!("NATS connection error: {}", e)))?;
        let js = jetstream::new(client.clone());

        Self::ensure_stream(&js, &topology).await?;

        tracing::info!(url = %nats_url, stream = %topology.stream, "Connected to NATS");
        Ok(Self {
            client,
            js,
            topology,
        })
    }

    async fn ensure_stream(js: &Context, topology: &NatsTopology) -> AppResult<()> {
        match js.get_stream(&topology.stream).await {
            Ok(_) => {
                tracing::debug!(stream = %topology.stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: topology.stream.clone(),
                    subjects: topology.stream_subjects(),
                    max_age: Duration::from_secs(24 * 3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| AppError::Queue(format!("JetStream error: {}", e)))?;

                tracing::info!(
                    stream = %topology.stream,
                    subjects = ?topology.stream_subjects(),
                    "Created NATS stream"
                );
                Ok(())
            }
        }
    }

    async fn ensure_consumer(
        &self,
        channel: Channel,
    ) -> AppResult<jetstream::consumer::Consumer<ConsumerConfig>> {
        let stream = self
            .js
            .get_stream(&self.topology.stream)
            .await
            .map_err(|e| AppError::Queue(e.to_string()))?;
        let durable = self.topology.durable_name(channel);

        match stream.get_consumer(&durable).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                let config = ConsumerConfig {
                    durable_name: Some(durable.clone()),
                    filter_subject: self.topology.subject(channel).to_string(),
                    ..Default::default()
                };
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| AppError::Queue(e.to_string()))?;
                tracing::info!(consumer = %durable, "Created NATS consumer");
                Ok(consumer)
            }
        }
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn settle(&self, disposition: Disposition) -> AppResult<()> {
        let kind = match disposition {
            Disposition::Ack => AckKind::Ack,
            Disposition::Retry => AckKind::Nak(None),
            Disposition::Reject => AckKind::Term,
        };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| AppError::Queue(format!("Failed to settle message: {}", e)))
    }
}

#[async_trait]
impl QueueClient for NatsQueue {
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> AppResult<()> {
        let subject = self.topology.subject(channel).to_string();

        if channel == Channel::Notifications {
            return self
                .client
                .publish(subject, payload.into())
                .await
                .map_err(|e| AppError::Queue(format!("Publish error: {}", e)));
        }

        self.js
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| AppError::Queue(format!("Publish error: {}", e)))?
            .await
            .map_err(|e| AppError::Queue(format!("Publish error: {}", e)))?;

        tracing::trace!(subject = %subject, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> AppResult<BoxStream<'static, Delivery>> {
        if channel == Channel::Notifications {
            return Err(AppError::Queue(
                "Notifications are fire-and-forget and cannot be consumed".to_string(),
            ));
        }

        let consumer = self.ensure_consumer(channel).await?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| AppError::Queue(e.to_string()))?;

        let deliveries = messages.filter_map(move |message| async move {
            match message {
                Ok(message) => {
                    let payload = message.payload.to_vec();
                    Some(Delivery::new(
                        channel,
                        payload,
                        Box::new(JetStreamAcker { message }),
                    ))
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Failed to receive message");
                    None
                }
            }
        });

        Ok(deliveries.boxed())
    }
}
