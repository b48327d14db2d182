//! In-memory instance repository.
//!
//! Used when the engine runs without PostgreSQL and as the fake in tests.
//! All conditional writes happen under the write lock, which gives them
//! the same compare-and-swap behaviour as the SQL `WHERE` guards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::state::RunStatus;
use crate::error::{AppError, AppResult};

use super::model::{DataMap, RetentionCandidate, StepInstance, StepResultUpdate, WorkflowInstance};
use super::InstanceRepository;

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<Uuid, StepInstance>,
}

impl Tables {
    fn run_mut(&mut self, uid: Uuid) -> AppResult<&mut WorkflowInstance> {
        self.runs
            .get_mut(&uid)
            .ok_or_else(|| AppError::NotFound(format!("Workflow instance {} not found", uid)))
    }

    fn step_mut(&mut self, uid: Uuid) -> AppResult<&mut StepInstance> {
        self.steps
            .get_mut(&uid)
            .ok_or_else(|| AppError::NotFound(format!("Step instance {} not found", uid)))
    }
}

/// Repository keeping every instance in process memory.
#[derive(Clone, Default)]
pub struct MemoryInstanceRepository {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_count(&self) -> usize {
        self.tables.read().await.runs.len()
    }

    pub async fn step_count(&self) -> usize {
        self.tables.read().await.steps.len()
    }
}

#[async_trait]
impl InstanceRepository for MemoryInstanceRepository {
    async fn insert_run(&self, run: &WorkflowInstance, steps: &[StepInstance]) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if tables.runs.contains_key(&run.uid) {
            return Err(AppError::Conflict(format!(
                "Workflow instance {} already exists",
                run.uid
            )));
        }
        tables.runs.insert(run.uid, run.clone());
        for step in steps {
            tables.steps.insert(step.uid, step.clone());
        }
        Ok(())
    }

    async fn get_run(&self, uid: Uuid) -> AppResult<Option<WorkflowInstance>> {
        Ok(self.tables.read().await.runs.get(&uid).cloned())
    }

    async fn get_step(&self, uid: Uuid) -> AppResult<Option<StepInstance>> {
        Ok(self.tables.read().await.steps.get(&uid).cloned())
    }

    async fn list_steps(&self, run_uid: Uuid) -> AppResult<Vec<StepInstance>> {
        let tables = self.tables.read().await;
        let mut steps: Vec<StepInstance> = tables
            .steps
            .values()
            .filter(|s| s.workflow_instance_uid == run_uid)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.execution_order);
        Ok(steps)
    }

    async fn find_step_by_name(&self, run_uid: Uuid, name: &str) -> AppResult<Option<StepInstance>> {
        let tables = self.tables.read().await;
        Ok(tables
            .steps
            .values()
            .find(|s| s.workflow_instance_uid == run_uid && s.name == name)
            .cloned())
    }

    async fn update_run_status(
        &self,
        uid: Uuid,
        status: RunStatus,
        expected: Option<RunStatus>,
    ) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let run = tables.run_mut(uid)?;
        if run.run_status.is_terminal() {
            return Ok(false);
        }
        if expected.is_some_and(|e| e != run.run_status) {
            return Ok(false);
        }
        run.run_status = status;
        Ok(true)
    }

    async fn set_run_start_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.tables.write().await.run_mut(uid)?.start_time = Some(at);
        Ok(())
    }

    async fn set_run_end_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.tables.write().await.run_mut(uid)?.end_time = Some(at);
        Ok(())
    }

    async fn record_run_error(&self, uid: Uuid, step_name: &str, reason: &str) -> AppResult<()> {
        self.tables
            .write()
            .await
            .run_mut(uid)?
            .error_messages
            .insert(step_name.to_string(), reason.to_string());
        Ok(())
    }

    async fn set_run_output(&self, uid: Uuid, output: &DataMap) -> AppResult<()> {
        self.tables.write().await.run_mut(uid)?.output_data = output.clone();
        Ok(())
    }

    async fn set_held_step(&self, uid: Uuid, step_uid: Option<Uuid>) -> AppResult<()> {
        self.tables.write().await.run_mut(uid)?.held_step_instance_uid = step_uid;
        Ok(())
    }

    async fn take_held_step(&self, uid: Uuid) -> AppResult<Option<Uuid>> {
        Ok(self
            .tables
            .write()
            .await
            .run_mut(uid)?
            .held_step_instance_uid
            .take())
    }

    async fn update_step_status(&self, uid: Uuid, status: RunStatus) -> AppResult<()> {
        self.tables.write().await.step_mut(uid)?.run_status = status;
        Ok(())
    }

    async fn launch_step(&self, uid: Uuid, input: &DataMap, at: DateTime<Utc>) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let step = tables.step_mut(uid)?;
        step.run_status = RunStatus::Running;
        step.input_data = input.clone();
        step.start_time = Some(at);
        step.end_time = None;
        step.failure_reason = None;
        Ok(())
    }

    async fn set_step_start_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.tables.write().await.step_mut(uid)?.start_time = Some(at);
        Ok(())
    }

    async fn set_step_end_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.tables.write().await.step_mut(uid)?.end_time = Some(at);
        Ok(())
    }

    async fn set_selected_case(&self, uid: Uuid, case_name: &str) -> AppResult<()> {
        self.tables.write().await.step_mut(uid)?.selected_case_name = Some(case_name.to_string());
        Ok(())
    }

    async fn decrement_retry(&self, uid: Uuid) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let step = tables.step_mut(uid)?;
        if step.retry_count <= 0 {
            return Ok(false);
        }
        step.retry_count -= 1;
        Ok(true)
    }

    async fn apply_step_result(&self, uid: Uuid, update: &StepResultUpdate) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        let step = tables.step_mut(uid)?;
        if step.run_status != RunStatus::Running || step.run_count != update.expected_run_count {
            return Ok(false);
        }
        step.run_status = update.run_status;
        step.output_data = update.output_data.clone();
        step.failure_reason = update.failure_reason.clone();
        step.end_time = Some(update.end_time);
        step.run_count += 1;
        Ok(true)
    }

    async fn list_top_level_runs(&self) -> AppResult<Vec<RetentionCandidate>> {
        let tables = self.tables.read().await;
        let mut candidates: Vec<RetentionCandidate> = tables
            .runs
            .values()
            .filter(|r| r.parent_instance_uid.is_none())
            .map(|r| RetentionCandidate {
                uid: r.uid,
                created_at: r.created_at,
            })
            .collect();
        candidates.sort_by_key(|c| c.created_at);
        Ok(candidates)
    }

    async fn delete_runs(&self, uids: &[Uuid]) -> AppResult<u64> {
        let mut tables = self.tables.write().await;

        let mut doomed: Vec<Uuid> = uids.to_vec();
        let mut cursor = 0;
        while cursor < doomed.len() {
            let parent = doomed[cursor];
            let children: Vec<Uuid> = tables
                .runs
                .values()
                .filter(|r| r.parent_instance_uid == Some(parent))
                .map(|r| r.uid)
                .collect();
            for child in children {
                if !doomed.contains(&child) {
                    doomed.push(child);
                }
            }
            cursor += 1;
        }

        let mut deleted = 0;
        for uid in &doomed {
            if tables.runs.remove(uid).is_some() {
                deleted += 1;
            }
        }
        tables
            .steps
            .retain(|_, step| !doomed.contains(&step.workflow_instance_uid));

        Ok(deleted)
    }
}
