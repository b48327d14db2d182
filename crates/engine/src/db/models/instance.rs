//! Rows of `flowmesh.workflow_instance` and `flowmesh.step_instance`.
//!
//! Status and label columns are stored as text and mapping columns as
//! JSONB; conversion into the domain model validates both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::engine::state::{RunOrderLabel, RunStatus};
use crate::error::{AppError, AppResult};
use crate::store::model::{DataMap, StepInstance, WorkflowInstance};

/// Workflow instance row.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowInstanceRow {
    pub uid: Uuid,
    pub workflow_uid: Uuid,
    pub name: String,
    #[sqlx(default)]
    pub description: Option<String>,
    pub run_status: String,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
    pub error_messages: serde_json::Value,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub parent_instance_uid: Option<Uuid>,
    pub parent_step_instance_uid: Option<Uuid>,
    pub step_instance_ids: Vec<Uuid>,
    pub held_step_instance_uid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Step instance row.
#[derive(Debug, Clone, FromRow)]
pub struct StepInstanceRow {
    pub uid: Uuid,
    pub workflow_instance_uid: Uuid,
    pub step_definition_uid: Uuid,
    pub name: String,
    pub control_structure: String,
    /// Serialized `StepStructure`
    pub structure: serde_json::Value,
    pub selected_case_name: Option<String>,
    pub run_status: String,
    pub run_order_label: String,
    pub execution_order: i32,
    pub next_step_id: Option<Uuid>,
    pub previous_step_id: Option<Uuid>,
    pub retry_count: i32,
    pub run_count: i32,
    pub input_data: serde_json::Value,
    pub output_data: serde_json::Value,
    pub failure_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

fn parse_status(raw: &str) -> AppResult<RunStatus> {
    raw.parse().map_err(AppError::Internal)
}

fn into_map(value: serde_json::Value) -> DataMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => DataMap::new(),
    }
}

impl TryFrom<WorkflowInstanceRow> for WorkflowInstance {
    type Error = AppError;

    fn try_from(row: WorkflowInstanceRow) -> AppResult<Self> {
        let error_messages: BTreeMap<String, String> = serde_json::from_value(row.error_messages)?;

        Ok(WorkflowInstance {
            uid: row.uid,
            workflow_uid: row.workflow_uid,
            name: row.name,
            description: row.description,
            run_status: parse_status(&row.run_status)?,
            input_data: into_map(row.input_data),
            output_data: into_map(row.output_data),
            error_messages,
            start_time: row.start_time,
            end_time: row.end_time,
            parent_instance_uid: row.parent_instance_uid,
            parent_step_instance_uid: row.parent_step_instance_uid,
            step_instance_ids: row.step_instance_ids,
            held_step_instance_uid: row.held_step_instance_uid,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<StepInstanceRow> for StepInstance {
    type Error = AppError;

    fn try_from(row: StepInstanceRow) -> AppResult<Self> {
        let run_order_label: RunOrderLabel = row
            .run_order_label
            .parse()
            .map_err(AppError::Internal)?;

        Ok(StepInstance {
            uid: row.uid,
            workflow_instance_uid: row.workflow_instance_uid,
            step_definition_uid: row.step_definition_uid,
            name: row.name,
            structure: serde_json::from_value(row.structure)?,
            selected_case_name: row.selected_case_name,
            run_status: parse_status(&row.run_status)?,
            run_order_label,
            execution_order: row.execution_order,
            next_step_id: row.next_step_id,
            previous_step_id: row.previous_step_id,
            retry_count: row.retry_count,
            run_count: row.run_count,
            input_data: into_map(row.input_data),
            output_data: into_map(row.output_data),
            failure_reason: row.failure_reason,
            start_time: row.start_time,
            end_time: row.end_time,
        })
    }
}
