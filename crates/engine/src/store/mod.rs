//! Instance store: persisted workflow and step instances.
//!
//! `InstanceRepository` is the persistence seam with a PostgreSQL and an
//! in-memory implementation. Every status write is conditional so that
//! terminal run states are never overwritten and duplicate results are
//! applied at most once. `InstanceStore` layers lifecycle bookkeeping and
//! run notifications on top of a repository.

pub mod graph;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::state::RunStatus;
use crate::error::AppResult;

pub use memory::MemoryInstanceRepository;
pub use model::{
    DataMap, RetentionCandidate, RunNotification, StepInstance, StepResultUpdate,
    WorkflowInstance,
};
pub use postgres::PgInstanceRepository;
pub use service::InstanceStore;

/// Storage operations for workflow and step instances.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Persist a new run together with all of its step instances.
    async fn insert_run(&self, run: &WorkflowInstance, steps: &[StepInstance]) -> AppResult<()>;

    async fn get_run(&self, uid: Uuid) -> AppResult<Option<WorkflowInstance>>;

    async fn get_step(&self, uid: Uuid) -> AppResult<Option<StepInstance>>;

    /// Steps of a run in execution order.
    async fn list_steps(&self, run_uid: Uuid) -> AppResult<Vec<StepInstance>>;

    async fn find_step_by_name(&self, run_uid: Uuid, name: &str) -> AppResult<Option<StepInstance>>;

    /// Set the run status unless the run is already terminal. When
    /// `expected` is given, the current status must equal it as well.
    /// Returns whether the write was applied.
    async fn update_run_status(
        &self,
        uid: Uuid,
        status: RunStatus,
        expected: Option<RunStatus>,
    ) -> AppResult<bool>;

    async fn set_run_start_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn set_run_end_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn record_run_error(&self, uid: Uuid, step_name: &str, reason: &str) -> AppResult<()>;

    async fn set_run_output(&self, uid: Uuid, output: &DataMap) -> AppResult<()>;

    async fn set_held_step(&self, uid: Uuid, step_uid: Option<Uuid>) -> AppResult<()>;

    /// Clear the held step and return what was held.
    async fn take_held_step(&self, uid: Uuid) -> AppResult<Option<Uuid>>;

    async fn update_step_status(&self, uid: Uuid, status: RunStatus) -> AppResult<()>;

    /// Mark a step RUNNING with fresh input; clears the previous end time
    /// and failure reason.
    async fn launch_step(&self, uid: Uuid, input: &DataMap, at: DateTime<Utc>) -> AppResult<()>;

    async fn set_step_start_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn set_step_end_time(&self, uid: Uuid, at: DateTime<Utc>) -> AppResult<()>;

    async fn set_selected_case(&self, uid: Uuid, case_name: &str) -> AppResult<()>;

    /// Consume one retry. Returns false when the budget is exhausted.
    async fn decrement_retry(&self, uid: Uuid) -> AppResult<bool>;

    /// Apply a result to a step that is RUNNING with the expected run
    /// count, incrementing the run count. Returns false for duplicates.
    async fn apply_step_result(&self, uid: Uuid, update: &StepResultUpdate) -> AppResult<bool>;

    /// Runs without a parent, oldest first.
    async fn list_top_level_runs(&self) -> AppResult<Vec<RetentionCandidate>>;

    /// Delete runs, their step instances and every descendant sub-workflow
    /// run. Returns the number of workflow instances removed.
    async fn delete_runs(&self, uids: &[Uuid]) -> AppResult<u64>;
}
