//! Persisted instance model: one workflow instance per run, one step
//! instance per step definition per run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::StepStructure;
use crate::engine::state::{RunOrderLabel, RunStatus};

pub type DataMap = serde_json::Map<String, serde_json::Value>;

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub uid: Uuid,
    pub workflow_uid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub run_status: RunStatus,
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: DataMap,
    /// Failure reasons keyed by step name.
    #[serde(default)]
    pub error_messages: BTreeMap<String, String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set only on sub-workflow runs.
    pub parent_instance_uid: Option<Uuid>,
    pub parent_step_instance_uid: Option<Uuid>,
    pub step_instance_ids: Vec<Uuid>,
    /// Step whose result arrived while the run was paused.
    pub held_step_instance_uid: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn is_sub_workflow(&self) -> bool {
        self.parent_instance_uid.is_some()
    }
}

/// Live execution state of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInstance {
    pub uid: Uuid,
    pub workflow_instance_uid: Uuid,
    pub step_definition_uid: Uuid,
    pub name: String,
    pub structure: StepStructure,
    /// Decision case picked the last time this SWITCH step was launched.
    pub selected_case_name: Option<String>,
    pub run_status: RunStatus,
    pub run_order_label: RunOrderLabel,
    pub execution_order: i32,
    pub next_step_id: Option<Uuid>,
    pub previous_step_id: Option<Uuid>,
    /// Remaining retries.
    pub retry_count: i32,
    /// Results processed so far.
    pub run_count: i32,
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub output_data: DataMap,
    pub failure_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StepInstance {
    /// Whether a completed result on this step may end the run.
    ///
    /// A single-step run labels its only step FIRST, so a missing
    /// next link counts as well.
    pub fn is_last(&self) -> bool {
        self.run_order_label == RunOrderLabel::Last || self.next_step_id.is_none()
    }
}

/// Result fields copied onto a step instance.
#[derive(Debug, Clone)]
pub struct StepResultUpdate {
    pub run_status: RunStatus,
    pub output_data: DataMap,
    pub failure_reason: Option<String>,
    pub end_time: DateTime<Utc>,
    /// Run count the step must currently have for the update to apply.
    pub expected_run_count: i32,
}

/// Status change announcement, published fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNotification {
    pub is_step_update: bool,
    pub workflow_instance_uid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_step_instance_uid: Option<Uuid>,
    pub status: RunStatus,
}

/// Top-level run summary used by the retention sweep.
#[derive(Debug, Clone)]
pub struct RetentionCandidate {
    pub uid: Uuid,
    pub created_at: DateTime<Utc>,
}
