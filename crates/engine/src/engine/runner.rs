//! Workflow runner: the result-driven state machine.
//!
//! A run advances only when something arrives: a start request, a step
//! result on the result channel, a deployment outcome or an operator
//! action. Each arrival is handled to completion and the runner keeps no
//! per-run state of its own; everything lives in the instance store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use uuid::Uuid;

use crate::catalog::{FunctionCatalog, FunctionInfo, WorkflowCatalog};
use crate::config::AppConfig;
use crate::definition::{CaseTarget, StepDefinition, StepStructure};
use crate::dispatch::{DeploymentOutcome, DispatchGateway, StepResult};
use crate::error::{AppError, AppResult};
use crate::queue::QueueClient;
use crate::store::{DataMap, InstanceStore, StepInstance, WorkflowInstance};

use super::deployment::DeploymentWatcher;
use super::state::{RunSnapshot, RunStatus};

/// Decision case taken when no case matches the switch value.
pub const DEFAULT_CASE: &str = "default";

/// Tunables of the runner taken from the application config.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub deployment_timeout: Duration,
    pub deployment_poll_interval: Duration,
    pub max_deployment_watchers: usize,
    pub retention_keep_days: i64,
    pub retention_max_count: usize,
}

impl RunnerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            deployment_timeout: config.deployment_timeout(),
            deployment_poll_interval: config.deployment_poll_interval(),
            max_deployment_watchers: config.max_deployment_watchers,
            retention_keep_days: config.retention_keep_days,
            retention_max_count: config.retention_max_count,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Failure attached to a run when it terminates.
struct RunFailure {
    step_name: String,
    reason: String,
}

impl RunFailure {
    fn new(step_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            reason: reason.into(),
        }
    }
}

pub struct WorkflowRunner {
    store: InstanceStore,
    gateway: DispatchGateway,
    functions: Arc<dyn FunctionCatalog>,
    workflows: Arc<dyn WorkflowCatalog>,
    deployments: DeploymentWatcher,
    settings: RunnerSettings,
}

impl WorkflowRunner {
    pub fn new(
        store: InstanceStore,
        gateway: DispatchGateway,
        functions: Arc<dyn FunctionCatalog>,
        workflows: Arc<dyn WorkflowCatalog>,
        queue: Arc<dyn QueueClient>,
        settings: RunnerSettings,
    ) -> Self {
        let deployments = DeploymentWatcher::new(
            functions.clone(),
            store.clone(),
            queue,
            settings.max_deployment_watchers,
            settings.deployment_timeout,
            settings.deployment_poll_interval,
        );

        Self {
            store,
            gateway,
            functions,
            workflows,
            deployments,
            settings,
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    pub fn gateway(&self) -> &DispatchGateway {
        &self.gateway
    }

    /// Start a run of `workflow_uid`.
    ///
    /// A sub-workflow run passes the parent run and the parent step it
    /// reports back to.
    pub fn start_workflow(
        &self,
        workflow_uid: Uuid,
        input_data: DataMap,
        parent_instance_uid: Option<Uuid>,
        parent_step_instance_uid: Option<Uuid>,
    ) -> BoxFuture<'_, AppResult<RunSnapshot>> {
        async move {
            let definition = self.workflows.get_workflow(workflow_uid).await?;
            let steps = if definition.steps.is_empty() {
                self.workflows.get_step_list(workflow_uid).await?
            } else {
                definition.steps.clone()
            };

            let (run, _) = self
                .store
                .generate_workflow_instance(
                    &definition,
                    &steps,
                    input_data,
                    parent_instance_uid,
                    parent_step_instance_uid,
                )
                .await?;

            tracing::info!(
                workflow_instance_uid = %run.uid,
                workflow = %definition.name,
                sub_workflow = run.is_sub_workflow(),
                "Starting workflow run"
            );

            self.store.set_workflow_start_time(run.uid).await?;

            let first = match self.store.get_start_step(run.uid).await {
                Ok(first) => first,
                Err(AppError::NotFound(reason)) => {
                    self.terminate(
                        run.uid,
                        RunStatus::FailedWithTerminalError,
                        Some(RunFailure::new(definition.name.as_str(), reason)),
                        None,
                    )
                    .await?;
                    return self.get_current_execution_state(run.uid).await;
                }
                Err(e) => return Err(e),
            };

            if matches!(first.structure, StepStructure::SubWorkflow { .. }) {
                self.store.update_workflow_status(run.uid, RunStatus::Running).await?;
                self.launch_step(first).await?;
                return self.get_current_execution_state(run.uid).await;
            }

            self.prepare_functions(run.uid, &steps, first).await?;
            self.get_current_execution_state(run.uid).await
        }
        .boxed()
    }

    /// Check every function the run may dispatch. Undeployed lazy functions
    /// get deployed while the run waits in DEPLOYING_FUNCTIONS; an
    /// undeployed eager one fails the run.
    async fn prepare_functions(
        &self,
        run_uid: Uuid,
        steps: &[StepDefinition],
        first: StepInstance,
    ) -> AppResult<()> {
        let mut referenced: BTreeMap<Uuid, &str> = BTreeMap::new();
        for step in steps {
            for function_ref in step.structure.function_refs() {
                referenced.entry(function_ref).or_insert(step.name.as_str());
            }
        }

        let mut undeployed: Vec<(FunctionInfo, &str)> = Vec::new();
        for (uid, step_name) in referenced {
            match self.functions.get_function(uid).await {
                Ok(function) if function.is_deployed() => {}
                Ok(function) => undeployed.push((function, step_name)),
                Err(AppError::NotFound(reason)) => {
                    return self
                        .terminate(
                            run_uid,
                            RunStatus::FailedWithTerminalError,
                            Some(RunFailure::new(step_name, reason)),
                            None,
                        )
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some((function, step_name)) = undeployed.iter().find(|(f, _)| !f.lazy_deployment) {
            return self
                .terminate(
                    run_uid,
                    RunStatus::FailedWithTerminalError,
                    Some(RunFailure::new(
                        *step_name,
                        format!(
                            "Function '{}' is not deployed and lazy deployment is disabled",
                            function.name
                        ),
                    )),
                    None,
                )
                .await;
        }

        if undeployed.is_empty() {
            self.store.update_workflow_status(run_uid, RunStatus::Running).await?;
            return self.launch_step(first).await;
        }

        let mut pending = Vec::with_capacity(undeployed.len());
        for (function, _) in &undeployed {
            if function.deployment_state != crate::catalog::DeploymentState::Deploying {
                self.functions.deploy_function(function.uid).await?;
            }
            pending.push(function.uid);
        }

        self.store
            .update_workflow_status(run_uid, RunStatus::DeployingFunctions)
            .await?;
        tracing::info!(
            workflow_instance_uid = %run_uid,
            functions = pending.len(),
            "Waiting for lazily deployed functions"
        );
        self.deployments.spawn(run_uid, pending);
        Ok(())
    }

    /// Handle one step result from the result channel.
    pub async fn process_result(&self, result: StepResult) -> AppResult<()> {
        let step = self.store.get_step_instance(result.step_instance_id).await?;

        let Some(step) = self.store.map_result_to_step_instance(&step, &result).await? else {
            return self.process_redelivery(step, &result).await;
        };

        let run = self.store.get_workflow_instance(step.workflow_instance_uid).await?;
        if run.run_status.is_terminal() {
            tracing::info!(
                workflow_instance_uid = %run.uid,
                step = %step.name,
                run_status = %run.run_status,
                "Result recorded on a finished run"
            );
            return Ok(());
        }

        if run.run_status == RunStatus::Paused {
            tracing::info!(
                workflow_instance_uid = %run.uid,
                step = %step.name,
                "Run is paused, holding step until resume"
            );
            return self.store.hold_step(run.uid, step.uid).await;
        }

        self.advance(step).await
    }

    /// A result the store refused is either a stale duplicate or a
    /// redelivery of the attempt already applied, whose follow-up work
    /// failed the first time. The latter picks the run up where it stopped.
    async fn process_redelivery(&self, step: StepInstance, result: &StepResult) -> AppResult<()> {
        let applied = result.attempt == Some(step.run_count)
            && step.run_status == result.run_status
            && step.run_status != RunStatus::Running;
        if !applied {
            tracing::info!(
                step_instance_uid = %step.uid,
                attempt = ?result.attempt,
                status = %result.run_status,
                "Ignoring duplicate step result"
            );
            return Ok(());
        }

        let run = self.store.get_workflow_instance(step.workflow_instance_uid).await?;
        match run.run_status {
            RunStatus::Running if self.awaits_follow_up(&step).await? => {
                tracing::info!(
                    workflow_instance_uid = %run.uid,
                    step = %step.name,
                    attempt = step.run_count,
                    "Re-driving redelivered step result"
                );
                self.advance(step).await
            }
            RunStatus::Paused if self.awaits_follow_up(&step).await? => {
                self.store.hold_step(run.uid, step.uid).await
            }
            RunStatus::Stopped => Ok(()),
            status if status.is_terminal() => {
                let failure_reason = run
                    .error_messages
                    .iter()
                    .next()
                    .map(|(step_name, reason)| format!("{}: {}", step_name, reason));
                let output = run.output_data.clone();
                self.report_to_parent(&run, status, failure_reason, output).await
            }
            _ => {
                tracing::debug!(
                    workflow_instance_uid = %run.uid,
                    step = %step.name,
                    "Redelivered step result already acted on"
                );
                Ok(())
            }
        }
    }

    /// Whether the transition out of `step`'s applied result never
    /// happened. A successor still NEW was never launched; a step still
    /// holding its result was never relaunched.
    async fn awaits_follow_up(&self, step: &StepInstance) -> AppResult<bool> {
        match step.run_status {
            RunStatus::Completed | RunStatus::Skipped => match self.store.get_next_step_instance(step).await {
                Ok(Some(next)) => Ok(next.uid == step.uid || next.run_status == RunStatus::New),
                Ok(None) => Ok(true),
                Err(e) if e.is_configuration() => Ok(true),
                Err(e) => Err(e),
            },
            RunStatus::Failed
            | RunStatus::TimedOut
            | RunStatus::Canceled
            | RunStatus::FailedWithTerminalError => Ok(true),
            _ => Ok(false),
        }
    }

    /// Move the run on from a step whose result has been applied.
    async fn advance(&self, step: StepInstance) -> AppResult<()> {
        let run_uid = step.workflow_instance_uid;
        tracing::debug!(
            workflow_instance_uid = %run_uid,
            step = %step.name,
            status = %step.run_status,
            run_count = step.run_count,
            "Advancing run"
        );

        match step.run_status {
            RunStatus::Completed | RunStatus::Skipped => {
                let next = match self.store.get_next_step_instance(&step).await {
                    Ok(next) => next,
                    Err(e) if e.is_configuration() => {
                        return self
                            .terminate(
                                run_uid,
                                RunStatus::Failed,
                                Some(RunFailure::new(step.name.as_str(), e.to_string())),
                                None,
                            )
                            .await;
                    }
                    Err(e) => return Err(e),
                };

                match next {
                    Some(next) => self.launch_step(next).await,
                    None if step.is_last() => {
                        self.terminate(run_uid, RunStatus::Completed, None, Some(&step.output_data))
                            .await
                    }
                    None => {
                        self.terminate(
                            run_uid,
                            RunStatus::Failed,
                            Some(RunFailure::new(
                                step.name.as_str(),
                                "function or sub-workflow not found",
                            )),
                            None,
                        )
                        .await
                    }
                }
            }

            RunStatus::Failed | RunStatus::TimedOut => {
                if self.store.consume_retry(step.uid).await? {
                    tracing::info!(
                        workflow_instance_uid = %run_uid,
                        step = %step.name,
                        status = %step.run_status,
                        "Retrying step"
                    );
                    let step = self.store.get_step_instance(step.uid).await?;
                    return self.launch_step(step).await;
                }
                let reason = failure_reason(&step);
                self.terminate(
                    run_uid,
                    step.run_status,
                    Some(RunFailure::new(step.name.as_str(), reason)),
                    None,
                )
                .await
            }

            RunStatus::Canceled | RunStatus::FailedWithTerminalError => {
                let reason = failure_reason(&step);
                self.terminate(
                    run_uid,
                    step.run_status,
                    Some(RunFailure::new(step.name.as_str(), reason)),
                    None,
                )
                .await
            }

            other => Err(AppError::UnexpectedStatus(format!(
                "Step '{}' reported {}",
                step.name, other
            ))),
        }
    }

    /// Launch a step. Configuration problems (bad expressions, unknown
    /// functions, no matching case) fail the run instead of surfacing.
    async fn launch_step(&self, step: StepInstance) -> AppResult<()> {
        let run_uid = step.workflow_instance_uid;
        match self.try_launch(&step).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_configuration() || matches!(e, AppError::NotFound(_)) => {
                tracing::warn!(
                    workflow_instance_uid = %run_uid,
                    step = %step.name,
                    error = %e,
                    "Step could not be launched"
                );
                self.terminate(
                    run_uid,
                    RunStatus::Failed,
                    Some(RunFailure::new(step.name.as_str(), e.to_string())),
                    None,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_launch(&self, step: &StepInstance) -> AppResult<()> {
        let run_uid = step.workflow_instance_uid;
        let input = self
            .store
            .evaluator()
            .normalize_input_data(&step.input_data, run_uid, Some(step))
            .await?;

        match &step.structure {
            StepStructure::Simple { function_ref } | StepStructure::DoWhile { function_ref, .. } => {
                self.dispatch_function(step, &input, *function_ref).await
            }
            StepStructure::SubWorkflow { sub_workflow_ref } => {
                self.start_sub_workflow(step, input, *sub_workflow_ref).await
            }
            StepStructure::Switch {
                switch_expression,
                decision_cases,
            } => {
                let value = self
                    .store
                    .evaluator()
                    .evaluate_switch_expression(step, switch_expression)
                    .await?;

                let (case_name, target) = decision_cases
                    .get_key_value(&value)
                    .or_else(|| decision_cases.get_key_value(DEFAULT_CASE))
                    .ok_or_else(|| {
                        AppError::NotFound(format!(
                            "No decision case matches '{}' and no default case exists",
                            value
                        ))
                    })?;

                tracing::debug!(
                    workflow_instance_uid = %run_uid,
                    step = %step.name,
                    value = %value,
                    case = %case_name,
                    "Switch case selected"
                );
                self.store.set_selected_case(step.uid, case_name).await?;

                match target {
                    CaseTarget::Function { function_ref } => {
                        self.dispatch_function(step, &input, *function_ref).await
                    }
                    CaseTarget::SubWorkflow { sub_workflow_ref } => {
                        self.start_sub_workflow(step, input, *sub_workflow_ref).await
                    }
                }
            }
        }
    }

    async fn dispatch_function(&self, step: &StepInstance, input: &DataMap, function_ref: Uuid) -> AppResult<()> {
        let function = self.functions.get_function(function_ref).await?;
        let running = self.store.launch_step(step, input).await?;
        self.gateway.send_to_executor(&running, input, &function).await
    }

    async fn start_sub_workflow(&self, step: &StepInstance, input: DataMap, workflow_uid: Uuid) -> AppResult<()> {
        let running = self.store.launch_step(step, &input).await?;
        let child = self
            .start_workflow(
                workflow_uid,
                input,
                Some(running.workflow_instance_uid),
                Some(running.uid),
            )
            .await?;
        tracing::info!(
            workflow_instance_uid = %running.workflow_instance_uid,
            step = %running.name,
            child_instance_uid = %child.run_uid,
            "Sub-workflow started"
        );
        Ok(())
    }

    /// Finish a run. Only the first terminal status sticks; later calls
    /// are no-ops.
    async fn terminate(
        &self,
        run_uid: Uuid,
        status: RunStatus,
        failure: Option<RunFailure>,
        output: Option<&DataMap>,
    ) -> AppResult<()> {
        if !self.store.update_workflow_status(run_uid, status).await? {
            tracing::debug!(
                workflow_instance_uid = %run_uid,
                status = %status,
                "Run already finished"
            );
            return Ok(());
        }

        self.store.set_workflow_end_time(run_uid).await?;
        if let Some(failure) = &failure {
            self.store
                .record_error(run_uid, &failure.step_name, &failure.reason)
                .await?;
        }
        let output = match (status, output) {
            (RunStatus::Completed, Some(output)) => {
                self.store.set_workflow_output(run_uid, output).await?;
                output.clone()
            }
            _ => DataMap::new(),
        };

        match &failure {
            Some(failure) => tracing::warn!(
                workflow_instance_uid = %run_uid,
                status = %status,
                step = %failure.step_name,
                reason = %failure.reason,
                "Run finished"
            ),
            None => tracing::info!(workflow_instance_uid = %run_uid, status = %status, "Run finished"),
        }

        let run = self.store.get_workflow_instance(run_uid).await?;
        let failure_reason = failure.map(|f| format!("{}: {}", f.step_name, f.reason));
        self.report_to_parent(&run, status, failure_reason, output).await?;

        let store = self.store.clone();
        let (keep_days, max_count) = (self.settings.retention_keep_days, self.settings.retention_max_count);
        tokio::spawn(async move { store.sweep_retention(keep_days, max_count).await });

        Ok(())
    }

    /// Publish a finished sub-workflow's verdict as the result of the
    /// parent step waiting on it. No-op for top-level runs and for parent
    /// steps that are no longer waiting on this run.
    async fn report_to_parent(
        &self,
        run: &WorkflowInstance,
        status: RunStatus,
        failure_reason: Option<String>,
        output: DataMap,
    ) -> AppResult<()> {
        let (Some(parent_uid), Some(parent_step_uid)) = (run.parent_instance_uid, run.parent_step_instance_uid)
        else {
            return Ok(());
        };

        // A retried parent step waits on a newer child than this one.
        let parent_step = self.store.get_step_instance(parent_step_uid).await?;
        let awaits_this_run = parent_step.run_status == RunStatus::Running
            && parent_step.start_time.map_or(true, |launched| launched <= run.created_at);
        if !awaits_this_run {
            return Ok(());
        }

        let result = StepResult {
            step_instance_id: parent_step_uid,
            workflow_instance_id: parent_uid,
            run_status: status.as_parent_step_result(),
            failure_reason,
            call_back_url: None,
            input_data: run.input_data.clone(),
            output_data: output,
            attempt: Some(parent_step.run_count + 1),
        };
        tracing::debug!(
            workflow_instance_uid = %run.uid,
            parent_instance_uid = %parent_uid,
            status = %result.run_status,
            "Reporting sub-workflow result to parent step"
        );
        self.gateway.publish_result(&result).await
    }

    /// Handle a deployment outcome from the deployment channel.
    pub async fn process_deployment_outcome(&self, outcome: DeploymentOutcome) -> AppResult<()> {
        let run_uid = outcome.workflow_instance_id;

        if !outcome.ready {
            let reason = outcome
                .failure_reason
                .unwrap_or_else(|| "Function deployment failed".to_string());
            let run = self.store.get_workflow_instance(run_uid).await?;
            if run.run_status != RunStatus::DeployingFunctions {
                return Ok(());
            }
            return self
                .terminate(
                    run_uid,
                    RunStatus::FailedWithTerminalError,
                    Some(RunFailure::new(run.name, reason)),
                    None,
                )
                .await;
        }

        let moved = self
            .store
            .transition_workflow_status(run_uid, RunStatus::DeployingFunctions, RunStatus::Running)
            .await?;
        let first = self.store.get_start_step(run_uid).await?;
        if !moved {
            // A redelivered outcome finishes a launch that failed after the
            // status swap.
            let run = self.store.get_workflow_instance(run_uid).await?;
            if run.run_status == RunStatus::Running && first.run_status == RunStatus::New {
                tracing::info!(
                    workflow_instance_uid = %run_uid,
                    step = %first.name,
                    "Launching first step for a redelivered deployment outcome"
                );
                return self.launch_step(first).await;
            }
            tracing::debug!(
                workflow_instance_uid = %run_uid,
                "Deployment outcome for a run no longer deploying"
            );
            return Ok(());
        }

        self.launch_step(first).await
    }

    /// Stop a run. Results still in flight are recorded but never acted on.
    pub async fn stop(&self, run_uid: Uuid) -> AppResult<RunSnapshot> {
        if !self.store.update_workflow_status(run_uid, RunStatus::Stopped).await? {
            let run = self.store.get_workflow_instance(run_uid).await?;
            return Err(AppError::Conflict(format!(
                "Run {} already finished with {}",
                run_uid, run.run_status
            )));
        }
        self.store.set_workflow_end_time(run_uid).await?;
        tracing::info!(workflow_instance_uid = %run_uid, "Run stopped");
        self.get_current_execution_state(run_uid).await
    }

    pub async fn pause(&self, run_uid: Uuid) -> AppResult<RunSnapshot> {
        self.require_transition(run_uid, RunStatus::Running, RunStatus::Paused)
            .await?;
        tracing::info!(workflow_instance_uid = %run_uid, "Run paused");
        self.get_current_execution_state(run_uid).await
    }

    /// Resume a paused run, re-driving the step whose result arrived while
    /// it was paused.
    pub async fn resume(&self, run_uid: Uuid) -> AppResult<RunSnapshot> {
        self.require_transition(run_uid, RunStatus::Paused, RunStatus::Running)
            .await?;
        tracing::info!(workflow_instance_uid = %run_uid, "Run resumed");

        if let Some(held) = self.store.take_held_step(run_uid).await? {
            let step = self.store.get_step_instance(held).await?;
            self.advance(step).await?;
        }

        self.get_current_execution_state(run_uid).await
    }

    async fn require_transition(&self, run_uid: Uuid, from: RunStatus, to: RunStatus) -> AppResult<()> {
        if self.store.transition_workflow_status(run_uid, from, to).await? {
            return Ok(());
        }
        let run = self.store.get_workflow_instance(run_uid).await?;
        Err(AppError::Conflict(format!(
            "Run {} is {}, expected {}",
            run_uid, run.run_status, from
        )))
    }

    pub async fn get_current_execution_state(&self, run_uid: Uuid) -> AppResult<RunSnapshot> {
        let run = self.store.get_workflow_instance(run_uid).await?;
        let steps = self.store.list_step_instances(run_uid).await?;
        Ok(RunSnapshot::from_instances(&run, &steps))
    }
}

fn failure_reason(step: &StepInstance) -> String {
    step.failure_reason
        .clone()
        .unwrap_or_else(|| format!("Step ended with {}", step.run_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DeploymentState, MemoryFunctionCatalog, MemoryWorkflowCatalog};
    use crate::config::DispatchMode;
    use crate::definition::{RestartPolicy, WorkflowDefinition};
    use crate::dispatch::WorkRequest;
    use crate::engine::handler::disposition_for;
    use crate::queue::{Channel, Delivery, Disposition, MemoryQueue};
    use crate::store::MemoryInstanceRepository;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn take_failure(failures: &AtomicUsize) -> bool {
        failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Function catalog that fails its next `failures` lookups.
    struct FlakyCatalog {
        inner: MemoryFunctionCatalog,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl FunctionCatalog for FlakyCatalog {
        async fn get_function(&self, uid: Uuid) -> AppResult<FunctionInfo> {
            if take_failure(&self.failures) {
                return Err(AppError::ExternalService("catalog unavailable".to_string()));
            }
            self.inner.get_function(uid).await
        }

        async fn deploy_function(&self, uid: Uuid) -> AppResult<()> {
            self.inner.deploy_function(uid).await
        }
    }

    /// Queue whose result channel fails its next `failures` publishes.
    struct FlakyResults {
        inner: MemoryQueue,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl QueueClient for FlakyResults {
        async fn publish(&self, channel: Channel, payload: Vec<u8>) -> AppResult<()> {
            if channel == Channel::Results && take_failure(&self.failures) {
                return Err(AppError::Queue("results stream unavailable".to_string()));
            }
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: Channel) -> AppResult<BoxStream<'static, Delivery>> {
            self.inner.subscribe(channel).await
        }
    }

    struct Harness {
        runner: WorkflowRunner,
        queue: MemoryQueue,
        functions: MemoryFunctionCatalog,
        workflows: MemoryWorkflowCatalog,
        catalog: Arc<FlakyCatalog>,
        results: Arc<FlakyResults>,
    }

    fn harness() -> Harness {
        let queue = MemoryQueue::new();
        let functions = MemoryFunctionCatalog::new();
        let workflows = MemoryWorkflowCatalog::new();
        let catalog = Arc::new(FlakyCatalog {
            inner: functions.clone(),
            failures: AtomicUsize::new(0),
        });
        let results = Arc::new(FlakyResults {
            inner: queue.clone(),
            failures: AtomicUsize::new(0),
        });
        let store = InstanceStore::new(Arc::new(MemoryInstanceRepository::new()), Arc::new(queue.clone()));
        let gateway = DispatchGateway::new(
            results.clone(),
            DispatchMode::Queue,
            "http://engine/api/callback",
            Duration::from_secs(1),
        );
        let runner = WorkflowRunner::new(
            store,
            gateway,
            catalog.clone(),
            Arc::new(workflows.clone()),
            Arc::new(queue.clone()),
            RunnerSettings::default(),
        );
        Harness {
            runner,
            queue,
            functions,
            workflows,
            catalog,
            results,
        }
    }

    async fn deployed_function(h: &Harness) -> Uuid {
        let uid = Uuid::new_v4();
        h.functions
            .insert(FunctionInfo {
                uid,
                name: format!("fn-{}", &uid.to_string()[..8]),
                function_type: "python".to_string(),
                deployment_state: DeploymentState::Deployed,
                lazy_deployment: false,
                service_url: None,
                cpu_request: None,
                memory_request: None,
            })
            .await;
        uid
    }

    async fn workflow(h: &Harness, structures: Vec<(&str, StepStructure, i32)>) -> Uuid {
        let uid = Uuid::new_v4();
        let steps = structures
            .into_iter()
            .enumerate()
            .map(|(i, (name, structure, retry_count))| StepDefinition {
                uid: Uuid::new_v4(),
                name: name.to_string(),
                execution_order: i as i32 + 1,
                retry_count,
                input_data: DataMap::new(),
                structure,
            })
            .collect();
        h.workflows
            .insert(WorkflowDefinition {
                uid,
                name: "wf".to_string(),
                description: None,
                steps,
                restart_policy: RestartPolicy::Never,
                timeout: None,
            })
            .await;
        uid
    }

    async fn next_work(h: &Harness) -> WorkRequest {
        let payload = h.queue.take(Channel::Work).await.expect("work request");
        crate::queue::decode(&payload).unwrap()
    }

    fn reply(work: &WorkRequest, status: RunStatus) -> StepResult {
        StepResult {
            step_instance_id: work.step_instance_id,
            workflow_instance_id: work.workflow_instance_id,
            run_status: status,
            failure_reason: None,
            call_back_url: None,
            input_data: work.input_data.clone(),
            output_data: DataMap::new(),
            attempt: Some(work.attempt),
        }
    }

    #[tokio::test]
    async fn test_single_step_run_completes() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(&h, vec![("only", StepStructure::Simple { function_ref: f }, 0)]).await;

        let snapshot = h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap();
        assert_eq!(snapshot.run_status, RunStatus::Running);

        let work = next_work(&h).await;
        h.runner.process_result(reply(&work, RunStatus::Completed)).await.unwrap();

        let state = h.runner.get_current_execution_state(snapshot.run_uid).await.unwrap();
        assert_eq!(state.run_status, RunStatus::Completed);
        assert!(state.end_time.is_some());
    }

    #[tokio::test]
    async fn test_skipped_last_step_completes_run() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(&h, vec![("only", StepStructure::Simple { function_ref: f }, 0)]).await;

        let snapshot = h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap();
        let work = next_work(&h).await;
        h.runner.process_result(reply(&work, RunStatus::Skipped)).await.unwrap();

        let state = h.runner.get_current_execution_state(snapshot.run_uid).await.unwrap();
        assert_eq!(state.run_status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(&h, vec![("only", StepStructure::Simple { function_ref: f }, 3)]).await;

        let snapshot = h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap();
        let work = next_work(&h).await;
        let mut result = reply(&work, RunStatus::FailedWithTerminalError);
        result.failure_reason = Some("bad credentials".to_string());
        h.runner.process_result(result).await.unwrap();

        let state = h.runner.get_current_execution_state(snapshot.run_uid).await.unwrap();
        assert_eq!(state.run_status, RunStatus::FailedWithTerminalError);
        assert!(state.failure_reason.unwrap().contains("bad credentials"));
        assert_eq!(h.queue.pending(Channel::Work).await, 0);
    }

    #[tokio::test]
    async fn test_unexpected_status_is_surfaced() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(&h, vec![("only", StepStructure::Simple { function_ref: f }, 0)]).await;

        h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap();
        let work = next_work(&h).await;
        let err = h
            .runner
            .process_result(reply(&work, RunStatus::Paused))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnexpectedStatus(_)));
    }

    #[tokio::test]
    async fn test_bad_switch_expression_fails_run() {
        let h = harness();
        let f = deployed_function(&h).await;
        let mut cases = BTreeMap::new();
        cases.insert("A".to_string(), CaseTarget::Function { function_ref: f });
        let wf = workflow(
            &h,
            vec![(
                "route",
                StepStructure::Switch {
                    switch_expression: "[missing.output.branch]".to_string(),
                    decision_cases: cases,
                },
                0,
            )],
        )
        .await;

        let snapshot = h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap();
        assert_eq!(snapshot.run_status, RunStatus::Failed);
        assert!(snapshot.failure_reason.unwrap().starts_with("route:"));
    }

    #[tokio::test]
    async fn test_pause_holds_result_until_resume() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(
            &h,
            vec![
                ("a", StepStructure::Simple { function_ref: f }, 0),
                ("b", StepStructure::Simple { function_ref: f }, 0),
            ],
        )
        .await;

        let snapshot = h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap();
        let run_uid = snapshot.run_uid;
        let work = next_work(&h).await;

        assert_eq!(h.runner.pause(run_uid).await.unwrap().run_status, RunStatus::Paused);
        h.runner.process_result(reply(&work, RunStatus::Completed)).await.unwrap();
        assert_eq!(h.queue.pending(Channel::Work).await, 0);

        let resumed = h.runner.resume(run_uid).await.unwrap();
        assert_eq!(resumed.run_status, RunStatus::Running);
        let second = next_work(&h).await;
        assert_ne!(second.step_instance_id, work.step_instance_id);
    }

    #[tokio::test]
    async fn test_operator_actions_respect_current_state() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(&h, vec![("only", StepStructure::Simple { function_ref: f }, 0)]).await;

        let run_uid = h
            .runner
            .start_workflow(wf, DataMap::new(), None, None)
            .await
            .unwrap()
            .run_uid;

        assert!(matches!(h.runner.resume(run_uid).await, Err(AppError::Conflict(_))));
        assert_eq!(h.runner.stop(run_uid).await.unwrap().run_status, RunStatus::Stopped);
        assert!(matches!(h.runner.stop(run_uid).await, Err(AppError::Conflict(_))));
        assert!(matches!(h.runner.pause(run_uid).await, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let h = harness();
        let err = h
            .runner
            .start_workflow(Uuid::new_v4(), DataMap::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_redelivered_result_resumes_after_transient_failure() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(
            &h,
            vec![
                ("a", StepStructure::Simple { function_ref: f }, 0),
                ("b", StepStructure::Simple { function_ref: f }, 0),
            ],
        )
        .await;

        let run_uid = h.runner.start_workflow(wf, DataMap::new(), None, None).await.unwrap().run_uid;
        let work = next_work(&h).await;

        h.catalog.failures.store(1, Ordering::SeqCst);
        let first = h.runner.process_result(reply(&work, RunStatus::Completed)).await;
        assert_eq!(disposition_for(&first), Disposition::Retry);
        assert_eq!(h.queue.pending(Channel::Work).await, 0);

        h.runner.process_result(reply(&work, RunStatus::Completed)).await.unwrap();
        let second = next_work(&h).await;
        let b = h.runner.store().get_step_instance(second.step_instance_id).await.unwrap();
        assert_eq!(b.name, "b");
        assert_eq!(b.run_status, RunStatus::Running);

        // Once b is under way the same result is a plain duplicate.
        h.runner.process_result(reply(&work, RunStatus::Completed)).await.unwrap();
        assert_eq!(h.queue.pending(Channel::Work).await, 0);
        assert_eq!(h.runner.get_current_execution_state(run_uid).await.unwrap().run_status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_redelivered_deployment_outcome_launches_first_step() {
        let h = harness();
        let f = deployed_function(&h).await;
        let wf = workflow(&h, vec![("only", StepStructure::Simple { function_ref: f }, 0)]).await;
        let definition = h.workflows.get_workflow(wf).await.unwrap();

        let store = h.runner.store();
        let (run, _) = store
            .generate_workflow_instance(&definition, &definition.steps, DataMap::new(), None, None)
            .await
            .unwrap();
        store
            .update_workflow_status(run.uid, RunStatus::DeployingFunctions)
            .await
            .unwrap();
        let outcome = DeploymentOutcome {
            workflow_instance_id: run.uid,
            ready: true,
            failure_reason: None,
        };

        h.catalog.failures.store(1, Ordering::SeqCst);
        assert!(h.runner.process_deployment_outcome(outcome.clone()).await.is_err());
        assert_eq!(store.get_workflow_instance(run.uid).await.unwrap().run_status, RunStatus::Running);
        assert_eq!(h.queue.pending(Channel::Work).await, 0);

        h.runner.process_deployment_outcome(outcome.clone()).await.unwrap();
        assert_eq!(h.queue.pending(Channel::Work).await, 1);

        h.runner.process_deployment_outcome(outcome).await.unwrap();
        assert_eq!(h.queue.pending(Channel::Work).await, 1);
    }

    #[tokio::test]
    async fn test_redelivered_child_result_reaches_parent() {
        let h = harness();
        let f = deployed_function(&h).await;
        let child = workflow(&h, vec![("inner", StepStructure::Simple { function_ref: f }, 0)]).await;
        let parent = workflow(
            &h,
            vec![("outer", StepStructure::SubWorkflow { sub_workflow_ref: child }, 0)],
        )
        .await;

        let parent_uid = h.runner.start_workflow(parent, DataMap::new(), None, None).await.unwrap().run_uid;
        let work = next_work(&h).await;
        let child_uid = work.workflow_instance_id;

        h.results.failures.store(1, Ordering::SeqCst);
        let first = h.runner.process_result(reply(&work, RunStatus::Completed)).await;
        assert_eq!(disposition_for(&first), Disposition::Retry);
        assert_eq!(
            h.runner.get_current_execution_state(child_uid).await.unwrap().run_status,
            RunStatus::Completed
        );
        assert_eq!(h.queue.pending(Channel::Results).await, 0);

        h.runner.process_result(reply(&work, RunStatus::Completed)).await.unwrap();
        let reported: Vec<StepResult> = h.queue.drain(Channel::Results).await.unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].workflow_instance_id, parent_uid);

        h.runner.process_result(reported[0].clone()).await.unwrap();
        assert_eq!(
            h.runner.get_current_execution_state(parent_uid).await.unwrap().run_status,
            RunStatus::Completed
        );

        // The parent step has its result now; nothing more is reported.
        h.runner.process_result(reply(&work, RunStatus::Completed)).await.unwrap();
        assert_eq!(h.queue.pending(Channel::Results).await, 0);
    }
}
