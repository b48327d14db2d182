//! Instance store service.
//!
//! Wraps an [`InstanceRepository`] with the lifecycle bookkeeping the
//! runner needs: instance generation, guarded result mapping, status
//! updates that announce themselves on the notification channel,
//! next-step resolution and the retention sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::definition::{StepDefinition, StepStructure, WorkflowDefinition};
use crate::dispatch::StepResult;
use crate::engine::evaluator::ExpressionEvaluator;
use crate::engine::state::{RunOrderLabel, RunStatus};
use crate::error::{AppError, AppResult};
use crate::queue::{self, Channel, QueueClient};
use crate::result_ext::ResultExt;

use super::graph::build_step_instances;
use super::model::{DataMap, RunNotification, StepInstance, StepResultUpdate, WorkflowInstance};
use super::InstanceRepository;

/// Store operations shared by the runner, handlers and deployment watchers.
#[derive(Clone)]
pub struct InstanceStore {
    repository: Arc<dyn InstanceRepository>,
    queue: Arc<dyn QueueClient>,
    evaluator: Arc<ExpressionEvaluator>,
}

impl InstanceStore {
    pub fn new(repository: Arc<dyn InstanceRepository>, queue: Arc<dyn QueueClient>) -> Self {
        let evaluator = Arc::new(ExpressionEvaluator::new(repository.clone()));
        Self {
            repository,
            queue,
            evaluator,
        }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub fn repository(&self) -> &Arc<dyn InstanceRepository> {
        &self.repository
    }

    /// Materialize a run: the workflow instance plus one step instance per
    /// step definition, linked in execution order. The run starts NEW.
    pub async fn generate_workflow_instance(
        &self,
        definition: &WorkflowDefinition,
        steps: &[StepDefinition],
        input_data: DataMap,
        parent_instance_uid: Option<Uuid>,
        parent_step_instance_uid: Option<Uuid>,
    ) -> AppResult<(WorkflowInstance, Vec<StepInstance>)> {
        if steps.is_empty() {
            return Err(AppError::Validation(format!(
                "Workflow '{}' has no steps",
                definition.name
            )));
        }

        let uid = Uuid::new_v4();
        let step_instances = build_step_instances(uid, steps, &input_data);

        let run = WorkflowInstance {
            uid,
            workflow_uid: definition.uid,
            name: definition.name.clone(),
            description: definition.description.clone(),
            run_status: RunStatus::New,
            input_data,
            output_data: DataMap::new(),
            error_messages: Default::default(),
            start_time: None,
            end_time: None,
            parent_instance_uid,
            parent_step_instance_uid,
            step_instance_ids: step_instances.iter().map(|s| s.uid).collect(),
            held_step_instance_uid: None,
            created_at: Utc::now(),
        };

        self.repository.insert_run(&run, &step_instances).await?;

        tracing::info!(
            workflow_instance_uid = %run.uid,
            workflow = %run.name,
            steps = step_instances.len(),
            parent_instance_uid = ?parent_instance_uid,
            "Workflow instance generated"
        );

        Ok((run, step_instances))
    }

    /// Copy a result onto its step instance.
    ///
    /// Applies only while the step is RUNNING and, when the result names
    /// its attempt, only for the attempt currently in flight. Returns the
    /// updated step, or `None` when the result is a duplicate.
    pub async fn map_result_to_step_instance(
        &self,
        step: &StepInstance,
        result: &StepResult,
    ) -> AppResult<Option<StepInstance>> {
        // No attempt can precede the first.
        let expected_run_count = match result.attempt {
            Some(attempt) if attempt < 1 => return Ok(None),
            Some(attempt) => attempt - 1,
            None => step.run_count,
        };
        let update = StepResultUpdate {
            run_status: result.run_status,
            output_data: result.output_data.clone(),
            failure_reason: result.failure_reason.clone(),
            end_time: Utc::now(),
            expected_run_count,
        };

        if !self.repository.apply_step_result(step.uid, &update).await? {
            return Ok(None);
        }

        self.notify(RunNotification {
            is_step_update: true,
            workflow_instance_uid: step.workflow_instance_uid,
            workflow_step_instance_uid: Some(step.uid),
            status: result.run_status,
        })
        .await;

        Ok(Some(self.get_step_instance(step.uid).await?))
    }

    /// Set a run's status unless it is already terminal.
    pub async fn update_workflow_status(&self, uid: Uuid, status: RunStatus) -> AppResult<bool> {
        self.write_workflow_status(uid, status, None).await
    }

    /// Set a run's status only if it currently is `from`.
    pub async fn transition_workflow_status(
        &self,
        uid: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> AppResult<bool> {
        self.write_workflow_status(uid, to, Some(from)).await
    }

    async fn write_workflow_status(
        &self,
        uid: Uuid,
        status: RunStatus,
        expected: Option<RunStatus>,
    ) -> AppResult<bool> {
        let applied = self
            .repository
            .update_run_status(uid, status, expected)
            .await?;

        if applied {
            tracing::debug!(workflow_instance_uid = %uid, status = %status, "Run status updated");
            self.notify(RunNotification {
                is_step_update: false,
                workflow_instance_uid: uid,
                workflow_step_instance_uid: None,
                status,
            })
            .await;
        }

        Ok(applied)
    }

    pub async fn update_step_status(&self, step: &StepInstance, status: RunStatus) -> AppResult<()> {
        self.repository.update_step_status(step.uid, status).await?;
        self.notify(RunNotification {
            is_step_update: true,
            workflow_instance_uid: step.workflow_instance_uid,
            workflow_step_instance_uid: Some(step.uid),
            status,
        })
        .await;
        Ok(())
    }

    /// Mark a step RUNNING with its normalized input and return the
    /// updated instance.
    pub async fn launch_step(&self, step: &StepInstance, input: &DataMap) -> AppResult<StepInstance> {
        self.repository.launch_step(step.uid, input, Utc::now()).await?;
        self.notify(RunNotification {
            is_step_update: true,
            workflow_instance_uid: step.workflow_instance_uid,
            workflow_step_instance_uid: Some(step.uid),
            status: RunStatus::Running,
        })
        .await;
        self.get_step_instance(step.uid).await
    }

    pub async fn set_workflow_start_time(&self, uid: Uuid) -> AppResult<()> {
        self.repository.set_run_start_time(uid, Utc::now()).await
    }

    pub async fn set_workflow_end_time(&self, uid: Uuid) -> AppResult<()> {
        self.repository.set_run_end_time(uid, Utc::now()).await
    }

    pub async fn set_step_start_time(&self, uid: Uuid) -> AppResult<()> {
        self.repository.set_step_start_time(uid, Utc::now()).await
    }

    pub async fn set_step_end_time(&self, uid: Uuid) -> AppResult<()> {
        self.repository.set_step_end_time(uid, Utc::now()).await
    }

    pub async fn record_error(&self, run_uid: Uuid, step_name: &str, reason: &str) -> AppResult<()> {
        self.repository.record_run_error(run_uid, step_name, reason).await
    }

    pub async fn set_workflow_output(&self, run_uid: Uuid, output: &DataMap) -> AppResult<()> {
        self.repository.set_run_output(run_uid, output).await
    }

    pub async fn hold_step(&self, run_uid: Uuid, step_uid: Uuid) -> AppResult<()> {
        self.repository.set_held_step(run_uid, Some(step_uid)).await
    }

    pub async fn take_held_step(&self, run_uid: Uuid) -> AppResult<Option<Uuid>> {
        self.repository.take_held_step(run_uid).await
    }

    pub async fn set_selected_case(&self, step_uid: Uuid, case_name: &str) -> AppResult<()> {
        self.repository.set_selected_case(step_uid, case_name).await
    }

    pub async fn consume_retry(&self, step_uid: Uuid) -> AppResult<bool> {
        self.repository.decrement_retry(step_uid).await
    }

    /// The step labelled FIRST. Its absence means the run was generated
    /// incorrectly.
    pub async fn get_start_step(&self, run_uid: Uuid) -> AppResult<StepInstance> {
        self.list_step_instances(run_uid)
            .await?
            .into_iter()
            .find(|s| s.run_order_label == RunOrderLabel::First)
            .ok_or_else(|| {
                AppError::NotFound(format!("No FIRST step in workflow instance {}", run_uid))
            })
    }

    /// Step to run after `step` finished.
    ///
    /// A DO_WHILE step yields itself until its stop condition holds; every
    /// other structure follows the next link.
    pub async fn get_next_step_instance(&self, step: &StepInstance) -> AppResult<Option<StepInstance>> {
        if let StepStructure::DoWhile { stop_condition, .. } = &step.structure {
            let stop = self
                .evaluator
                .evaluate_do_while_condition(step.workflow_instance_uid, stop_condition, step)
                .await?;
            if !stop {
                return Ok(Some(step.clone()));
            }
        }

        match step.next_step_id {
            Some(next) => self.repository.get_step(next).await,
            None => Ok(None),
        }
    }

    /// Delete top-level runs older than `keep_days`, oldest first, while
    /// more than `max_count` top-level runs remain. Deletion cascades to
    /// step instances and sub-workflow runs.
    pub async fn delete_last_workflow_instances(&self, keep_days: i64, max_count: usize) -> AppResult<u64> {
        let candidates = self.repository.list_top_level_runs().await?;
        let cutoff = Utc::now() - Duration::days(keep_days);

        let mut survivors = candidates.len();
        let mut doomed = Vec::new();
        for candidate in &candidates {
            if survivors <= max_count {
                break;
            }
            if candidate.created_at < cutoff {
                doomed.push(candidate.uid);
                survivors -= 1;
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }

        let deleted = self.repository.delete_runs(&doomed).await?;
        tracing::info!(
            top_level = doomed.len(),
            deleted,
            keep_days,
            max_count,
            "Retention sweep removed workflow instances"
        );
        Ok(deleted)
    }

    /// Best-effort retention sweep.
    pub async fn sweep_retention(&self, keep_days: i64, max_count: usize) {
        let _ = self
            .delete_last_workflow_instances(keep_days, max_count)
            .await
            .swallow("retention sweep");
    }

    pub async fn get_workflow_instance(&self, uid: Uuid) -> AppResult<WorkflowInstance> {
        self.repository
            .get_run(uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow instance {} not found", uid)))
    }

    pub async fn get_step_instance(&self, uid: Uuid) -> AppResult<StepInstance> {
        self.repository
            .get_step(uid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Step instance {} not found", uid)))
    }

    pub async fn list_step_instances(&self, run_uid: Uuid) -> AppResult<Vec<StepInstance>> {
        self.repository.list_steps(run_uid).await
    }

    async fn notify(&self, notification: RunNotification) {
        let _ = queue::publish_json(self.queue.as_ref(), Channel::Notifications, &notification)
            .await
            .swallow("publishing run notification");
    }
}
