//! Queue message handler feeding the runner.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{DeploymentOutcome, DispatchGateway};
use crate::error::{AppError, AppResult};
use crate::queue::{self, Channel, Disposition, MessageHandler};
use crate::result_ext::ResultExt;

use super::runner::WorkflowRunner;

/// Routes result and deployment messages into the runner and settles
/// them according to how handling went.
pub struct EngineHandler {
    runner: Arc<WorkflowRunner>,
}

impl EngineHandler {
    pub fn new(runner: Arc<WorkflowRunner>) -> Self {
        Self { runner }
    }

    async fn dispatch(&self, channel: Channel, payload: &[u8]) -> AppResult<()> {
        match channel {
            Channel::Results => {
                let result = DispatchGateway::decode_result(payload)?;
                self.runner.process_result(result).await
            }
            Channel::Deployments => {
                let outcome: DeploymentOutcome = queue::decode(payload)?;
                self.runner.process_deployment_outcome(outcome).await
            }
            other => Err(AppError::Validation(format!(
                "Engine does not consume the {} channel",
                other
            ))),
        }
    }
}

#[async_trait]
impl MessageHandler for EngineHandler {
    async fn handle(&self, channel: Channel, payload: &[u8]) -> Disposition {
        let outcome = self
            .dispatch(channel, payload)
            .await
            .log(format!("handling {} message", channel));
        disposition_for(&outcome)
    }
}

/// Malformed or unprocessable messages are dropped; infrastructure
/// failures are redelivered.
pub fn disposition_for(outcome: &AppResult<()>) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(
            AppError::Database(_)
            | AppError::Queue(_)
            | AppError::ExternalService(_)
            | AppError::Internal(_),
        ) => Disposition::Retry,
        Err(_) => Disposition::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryFunctionCatalog, MemoryWorkflowCatalog};
    use crate::config::DispatchMode;
    use crate::engine::runner::RunnerSettings;
    use crate::queue::MemoryQueue;
    use crate::store::{InstanceStore, MemoryInstanceRepository};
    use std::time::Duration;

    fn handler() -> EngineHandler {
        let queue = MemoryQueue::new();
        let store = InstanceStore::new(Arc::new(MemoryInstanceRepository::new()), Arc::new(queue.clone()));
        let gateway = DispatchGateway::new(
            Arc::new(queue.clone()),
            DispatchMode::Queue,
            "http://engine/api/callback",
            Duration::from_secs(1),
        );
        let runner = WorkflowRunner::new(
            store,
            gateway,
            Arc::new(MemoryFunctionCatalog::new()),
            Arc::new(MemoryWorkflowCatalog::new()),
            Arc::new(queue),
            RunnerSettings::default(),
        );
        EngineHandler::new(Arc::new(runner))
    }

    #[test]
    fn test_disposition_mapping() {
        assert_eq!(disposition_for(&Ok(())), Disposition::Ack);
        assert_eq!(
            disposition_for(&Err(AppError::Queue("down".to_string()))),
            Disposition::Retry
        );
        assert_eq!(
            disposition_for(&Err(AppError::UnexpectedStatus("PAUSED".to_string()))),
            Disposition::Reject
        );
        assert_eq!(
            disposition_for(&Err(AppError::NotFound("step".to_string()))),
            Disposition::Reject
        );
    }

    #[tokio::test]
    async fn test_garbage_payload_is_rejected() {
        let handler = handler();
        assert_eq!(handler.handle(Channel::Results, b"{").await, Disposition::Reject);
        assert_eq!(handler.handle(Channel::Deployments, b"[]").await, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_result_for_unknown_step_is_rejected() {
        let handler = handler();
        let payload = serde_json::json!({
            "stepInstanceId": uuid::Uuid::new_v4(),
            "workflowInstanceId": uuid::Uuid::new_v4(),
            "runStatus": "COMPLETED"
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert_eq!(handler.handle(Channel::Results, &bytes).await, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_work_channel_is_not_consumed() {
        let handler = handler();
        assert_eq!(handler.handle(Channel::Work, b"{}").await, Disposition::Reject);
    }
}
