//! Run and step status vocabulary plus the read-only run snapshot.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::model::{StepInstance, WorkflowInstance};

/// Status of a run or of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    New,
    DeployingFunctions,
    Running,
    Paused,
    Skipped,
    Completed,
    CompletedWithErrors,
    Failed,
    FailedWithTerminalError,
    Canceled,
    TimedOut,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::DeployingFunctions => "DEPLOYING_FUNCTIONS",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Skipped => "SKIPPED",
            Self::Completed => "COMPLETED",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Failed => "FAILED",
            Self::FailedWithTerminalError => "FAILED_WITH_TERMINAL_ERROR",
            Self::Canceled => "CANCELED",
            Self::TimedOut => "TIMED_OUT",
            Self::Stopped => "STOPPED",
        }
    }

    /// Terminal run states. Once a run reaches one of these, its status
    /// never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithErrors
                | Self::Failed
                | Self::FailedWithTerminalError
                | Self::Canceled
                | Self::TimedOut
                | Self::Stopped
        )
    }

    /// All terminal states, for queries that filter on them.
    pub fn terminal_states() -> [RunStatus; 7] {
        [
            Self::Completed,
            Self::CompletedWithErrors,
            Self::Failed,
            Self::FailedWithTerminalError,
            Self::Canceled,
            Self::TimedOut,
            Self::Stopped,
        ]
    }

    /// Status a parent step receives when a sub-workflow run ends in `self`.
    pub fn as_parent_step_result(&self) -> RunStatus {
        match self {
            Self::Completed | Self::CompletedWithErrors => Self::Completed,
            Self::TimedOut => Self::TimedOut,
            Self::FailedWithTerminalError => Self::FailedWithTerminalError,
            Self::Canceled | Self::Stopped => Self::Canceled,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "DEPLOYING_FUNCTIONS" => Ok(Self::DeployingFunctions),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "SKIPPED" => Ok(Self::Skipped),
            "COMPLETED" => Ok(Self::Completed),
            "COMPLETED_WITH_ERRORS" => Ok(Self::CompletedWithErrors),
            "FAILED" => Ok(Self::Failed),
            "FAILED_WITH_TERMINAL_ERROR" => Ok(Self::FailedWithTerminalError),
            "CANCELED" | "CANCELLED" => Ok(Self::Canceled),
            "TIMED_OUT" => Ok(Self::TimedOut),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(format!("Unknown run status: {}", other)),
        }
    }
}

/// Position of a step in its run, fixed when the run is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOrderLabel {
    First,
    Intermediate,
    Last,
}

impl RunOrderLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::First => "FIRST",
            Self::Intermediate => "INTERMEDIATE",
            Self::Last => "LAST",
        }
    }

    /// Label for the step at `index` in a run of `len` steps.
    pub fn for_position(index: usize, len: usize) -> Self {
        if index == 0 {
            Self::First
        } else if index + 1 == len {
            Self::Last
        } else {
            Self::Intermediate
        }
    }
}

impl FromStr for RunOrderLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIRST" => Ok(Self::First),
            "INTERMEDIATE" => Ok(Self::Intermediate),
            "LAST" => Ok(Self::Last),
            other => Err(format!("Unknown run order label: {}", other)),
        }
    }
}

/// Plain tag of a step's control structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlStructure {
    Simple,
    Switch,
    DoWhile,
    SubWorkflow,
}

impl ControlStructure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Switch => "SWITCH",
            Self::DoWhile => "DO_WHILE",
            Self::SubWorkflow => "SUB_WORKFLOW",
        }
    }
}

/// Step entry of a run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub uid: Uuid,
    pub name: String,
    pub control_structure: ControlStructure,
    pub run_status: RunStatus,
    pub run_order_label: RunOrderLabel,
    pub run_count: i32,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_case_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Read-only view of a run, returned by start and state queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_uid: Uuid,
    pub workflow_name: String,
    pub run_status: RunStatus,
    pub run_steps: Vec<StepSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub output_data: serde_json::Map<String, serde_json::Value>,
}

impl RunSnapshot {
    /// Build a snapshot from a run and its steps, steps in execution order.
    pub fn from_instances(run: &WorkflowInstance, steps: &[StepInstance]) -> Self {
        let mut ordered: Vec<&StepInstance> = steps.iter().collect();
        ordered.sort_by_key(|s| s.execution_order);

        let failure_reason = if run.error_messages.is_empty() {
            None
        } else {
            Some(
                run.error_messages
                    .iter()
                    .map(|(step, reason)| format!("{}: {}", step, reason))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        Self {
            run_uid: run.uid,
            workflow_name: run.name.clone(),
            run_status: run.run_status,
            run_steps: ordered
                .into_iter()
                .map(|s| StepSnapshot {
                    uid: s.uid,
                    name: s.name.clone(),
                    control_structure: s.structure.control_structure(),
                    run_status: s.run_status,
                    run_order_label: s.run_order_label,
                    run_count: s.run_count,
                    retry_count: s.retry_count,
                    selected_case_name: s.selected_case_name.clone(),
                    failure_reason: s.failure_reason.clone(),
                    start_time: s.start_time,
                    end_time: s.end_time,
                })
                .collect(),
            start_time: run.start_time,
            end_time: run.end_time,
            failure_reason,
            output_data: run.output_data.clone(),
        }
    }
}
