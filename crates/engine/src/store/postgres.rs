//! PostgreSQL instance repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::queries::{step_instance, workflow_instance};
use crate::db::DbPool;
use crate::engine::state::RunStatus;
use crate::error::AppResult;

use super::model::{DataMap, RetentionCandidate, StepInstance, StepResultUpdate, WorkflowInstance};
use super::InstanceRepository;

/// Repository backed by the `flowmesh` schema.
#[derive(Clone)]
pub struct PgInstanceRepository {
    db: DbPool,
}

impl PgInstanceRepository {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl InstanceRepository for PgInstanceRepository {
    async fn insert_run(&self, run: &WorkflowInstance, steps: &[StepInstance]) -> AppResult<()> {
        let mut tx = self.db.begin().await?;
        workflow_instance::insert_workflow_instance(&mut tx, run).await?;
        for step in steps {
            step_instance::insert_step_instance(&mut tx, step).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, uid: Uuid) -> AppResult<Option<WorkflowInstance>> {
        workflow_instance::get_workflow_instance(&self.db, uid)
            .await?
            .map(WorkflowInstance::try_from)
            .transpose()
    }

    async fn get_step(&self, uid: Uuid) -> AppResult<Option<StepInstance>> {
        step_instance::get_step_instance(&self.db, uid)
            .await?
            .map(StepInstance::try_from)
            .transpose()
    }

    async fn list_steps(&self, run_uid: Uuid) -> AppResult<Vec<StepInstance>> {
        step_instance::list_for_workflow(&self.db, run_uid)
            .await?
            .into_iter()
            .map(StepInstance::try_from)
            .collect()
    }

    async fn find_step_by_name(&self, run_uid: Uuid, name: &str) -> AppResult<Option<StepInstance>> {
        step_instance::find_by_name(&self.db, run_uid, name)
            .await?
            .map(StepInstance::try_from)
            .transpose()
    }

    async fn update_run_status(
        &self,
        uid: Uuid,
        status: RunStatus,
        expected: Option<RunStatus>,
    ) -> AppResult<bool> {
        workflow_instance::update_run_status(&self.db, uid, status, expected).await
    }

    async fn set_run_start_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        workflow_instance::set_start_time(&self.db, uid, at).await
    }

    async fn set_run_end_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        workflow_instance::set_end_time(&self.db, uid, at).await
    }

    async fn record_run_error(&self, uid: Uuid, step_name: &str, reason: &str) -> AppResult<()> {
        workflow_instance::record_error(&self.db, uid, step_name, reason).await
    }

    async fn set_run_output(&self, uid: Uuid, output: &DataMap) -> AppResult<()> {
        workflow_instance::set_output(&self.db, uid, output).await
    }

    async fn set_held_step(&self, uid: Uuid, step_uid: Option<Uuid>) -> AppResult<()> {
        workflow_instance::set_held_step(&self.db, uid, step_uid).await
    }

    async fn take_held_step(&self, uid: Uuid) -> AppResult<Option<Uuid>> {
        workflow_instance::take_held_step(&self.db, uid).await
    }

    async fn update_step_status(&self, uid: Uuid, status: RunStatus) -> AppResult<()> {
        step_instance::update_status(&self.db, uid, status).await
    }

    async fn launch_step(&self, uid: Uuid, input: &DataMap, at: DateTime<Utc>) -> AppResult<()> {
        step_instance::launch(&self.db, uid, input, at).await
    }

    async fn set_step_start_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        step_instance::set_start_time(&self.db, uid, at).await
    }

    async fn set_step_end_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        step_instance::set_end_time(&self.db, uid, at).await
    }

    async fn set_selected_case(&self, uid: Uuid, case_name: &str) -> AppResult<()> {
        step_instance::set_selected_case(&self.db, uid, case_name).await
    }

    async fn decrement_retry(&self, uid: Uuid) -> AppResult<bool> {
        step_instance::decrement_retry(&self.db, uid).await
    }

    async fn apply_step_result(&self, uid: Uuid, update: &StepResultUpdate) -> AppResult<bool> {
        step_instance::apply_result(&self.db, uid, update).await
    }

    async fn list_top_level_runs(&self) -> AppResult<Vec<RetentionCandidate>> {
        Ok(workflow_instance::list_top_level(&self.db)
            .await?
            .into_iter()
            .map(|(uid, created_at)| RetentionCandidate { uid, created_at })
            .collect())
    }

    async fn delete_runs(&self, uids: &[Uuid]) -> AppResult<u64> {
        if uids.is_empty() {
            return Ok(0);
        }
        workflow_instance::delete_with_descendants(&self.db, uids).await
    }
}
