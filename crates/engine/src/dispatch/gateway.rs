//! Dispatch gateway: hands a runnable step to its function.
//!
//! In queue mode the step becomes a work request on the work channel; in
//! push mode its input is POSTed to the function's service URL. Either
//! way, a failure to hand the work off is reported as a CANCELED result
//! on the result channel, so the runner sees one failure path only.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::catalog::FunctionInfo;
use crate::config::DispatchMode;
use crate::error::{AppError, AppResult};
use crate::queue::{self, Channel, QueueClient};
use crate::store::{DataMap, StepInstance};

use super::messages::{PushRequest, StepResult, WorkRequest};

/// Turns steps into outbound work and inbound payloads into results.
#[derive(Clone)]
pub struct DispatchGateway {
    queue: Arc<dyn QueueClient>,
    mode: DispatchMode,
    callback_url: String,
    http: reqwest::Client,
}

impl DispatchGateway {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        mode: DispatchMode,
        callback_url: &str,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            queue,
            mode,
            callback_url: callback_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Send `step` with the given input to `function`.
    ///
    /// Hand-off failures never surface as errors here; they come back as
    /// a CANCELED result. Only a failure to publish that result is
    /// returned.
    pub async fn send_to_executor(
        &self,
        step: &StepInstance,
        input: &DataMap,
        function: &FunctionInfo,
    ) -> AppResult<()> {
        let attempt = step.run_count + 1;
        let handed_off = match self.mode {
            DispatchMode::Queue => self.enqueue(step, input, function, attempt).await,
            DispatchMode::Push => self.push(step, input, function, attempt).await,
        };

        match handed_off {
            Ok(()) => {
                tracing::debug!(
                    step_instance_uid = %step.uid,
                    function = %function.name,
                    attempt,
                    "Step dispatched"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    step_instance_uid = %step.uid,
                    function = %function.name,
                    error = %e,
                    "Dispatch failed, reporting step as canceled"
                );
                let result = StepResult::canceled(
                    step.workflow_instance_uid,
                    step.uid,
                    attempt,
                    format!("Gateway failed to dispatch function '{}': {}", function.name, e),
                );
                self.publish_result(&result).await
            }
        }
    }

    async fn enqueue(
        &self,
        step: &StepInstance,
        input: &DataMap,
        function: &FunctionInfo,
        attempt: i32,
    ) -> AppResult<()> {
        let request = WorkRequest {
            step_instance_id: step.uid,
            workflow_instance_id: step.workflow_instance_uid,
            run_status: step.run_status,
            service_url: function.service_url.clone(),
            function_name: function.name.clone(),
            function_type: function.function_type.clone(),
            cpu_request: function.cpu_request.clone(),
            memory_request: function.memory_request.clone(),
            input_data: input.clone(),
            output_data: step.output_data.clone(),
            attempt,
        };

        queue::publish_json(self.queue.as_ref(), Channel::Work, &request).await
    }

    async fn push(
        &self,
        step: &StepInstance,
        input: &DataMap,
        function: &FunctionInfo,
        attempt: i32,
    ) -> AppResult<()> {
        let service_url = function.service_url.as_deref().ok_or_else(|| {
            AppError::ExternalService(format!("Function '{}' has no service URL", function.name))
        })?;

        let body = PushRequest {
            input_data: input.clone(),
            callback_url: self.callback_for(step.workflow_instance_uid, step.uid, attempt),
            failure_reason: None,
        };

        let response = self.http.post(service_url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "Function responded with {}: {}",
                status, text
            )));
        }

        Ok(())
    }

    /// Callback URL a pushed function reports its result to.
    pub fn callback_for(&self, workflow_instance_uid: Uuid, step_instance_uid: Uuid, attempt: i32) -> String {
        format!(
            "{}/{}/{}?attempt={}",
            self.callback_url, workflow_instance_uid, step_instance_uid, attempt
        )
    }

    /// Publish a result on the result channel.
    pub async fn publish_result(&self, result: &StepResult) -> AppResult<()> {
        queue::publish_json(self.queue.as_ref(), Channel::Results, result).await
    }

    /// Decode an inbound result payload.
    pub fn decode_result(payload: &[u8]) -> AppResult<StepResult> {
        queue::decode(payload)
    }
}
