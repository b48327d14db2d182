//! Definition types as served by the workflow catalog.
//!
//! A step's control structure is a tagged union: each variant carries only
//! the fields its structure needs, and the runner matches on it
//! exhaustively.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::state::ControlStructure;

/// Restart behaviour declared on a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

/// Workflow definition (read-only to the engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub uid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Step definitions; the catalog may omit them here and serve them
    /// through the step-list endpoint instead.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Timeout in seconds, enforced by executors.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Step definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub uid: Uuid,
    pub name: String,
    pub execution_order: i32,
    /// Retry budget for FAILED/TIMED_OUT results.
    #[serde(default)]
    pub retry_count: i32,
    /// Input template; string values may carry `@formula#...#` markers.
    #[serde(default)]
    pub input_data: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub structure: StepStructure,
}

/// Control structure of a step and its structure-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "controlStructure", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStructure {
    #[serde(rename_all = "camelCase")]
    Simple { function_ref: Uuid },

    #[serde(rename_all = "camelCase")]
    Switch {
        switch_expression: String,
        decision_cases: BTreeMap<String, CaseTarget>,
    },

    #[serde(rename_all = "camelCase")]
    DoWhile {
        function_ref: Uuid,
        stop_condition: String,
    },

    #[serde(rename_all = "camelCase")]
    SubWorkflow { sub_workflow_ref: Uuid },
}

/// What a SWITCH decision case runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseTarget {
    #[serde(rename_all = "camelCase")]
    Function { function_ref: Uuid },

    #[serde(rename_all = "camelCase")]
    SubWorkflow { sub_workflow_ref: Uuid },
}

impl StepStructure {
    pub fn control_structure(&self) -> ControlStructure {
        match self {
            StepStructure::Simple { .. } => ControlStructure::Simple,
            StepStructure::Switch { .. } => ControlStructure::Switch,
            StepStructure::DoWhile { .. } => ControlStructure::DoWhile,
            StepStructure::SubWorkflow { .. } => ControlStructure::SubWorkflow,
        }
    }

    /// Every function this step may dispatch, including each decision case.
    pub fn function_refs(&self) -> Vec<Uuid> {
        match self {
            StepStructure::Simple { function_ref } | StepStructure::DoWhile { function_ref, .. } => {
                vec![*function_ref]
            }
            StepStructure::Switch { decision_cases, .. } => decision_cases
                .values()
                .filter_map(|target| match target {
                    CaseTarget::Function { function_ref } => Some(*function_ref),
                    CaseTarget::SubWorkflow { .. } => None,
                })
                .collect(),
            StepStructure::SubWorkflow { .. } => Vec::new(),
        }
    }
}
