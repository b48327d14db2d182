//! Bounded consumer loop shared by every queue implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Semaphore;

use crate::error::AppResult;

use super::{Channel, Delivery, Disposition, QueueClient};

/// Handles one consumed payload and decides how it is settled.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, channel: Channel, payload: &[u8]) -> Disposition;
}

/// Consume `channel` until the stream ends, handling at most as many
/// messages at once as the semaphore allows.
pub async fn run_consumer(
    queue: Arc<dyn QueueClient>,
    channel: Channel,
    handler: Arc<dyn MessageHandler>,
    semaphore: Arc<Semaphore>,
) -> AppResult<()> {
    let mut deliveries = queue.subscribe(channel).await?;
    tracing::info!(channel = %channel, "Consumer started");

    while let Some(delivery) = deliveries.next().await {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| crate::error::AppError::Internal(e.to_string()))?;
        let handler = handler.clone();

        tokio::spawn(async move {
            let _permit = permit;
            settle(&delivery, handler.handle(delivery.channel, &delivery.payload).await).await;
        });
    }

    tracing::info!(channel = %channel, "Consumer stopped");
    Ok(())
}

async fn settle(delivery: &Delivery, disposition: Disposition) {
    if let Err(e) = delivery.settle(disposition).await {
        tracing::warn!(
            channel = %delivery.channel,
            disposition = ?disposition,
            error = %e,
            "Failed to settle message"
        );
    }
}
