//! Workflow and step definitions.
//!
//! Definitions are owned by the workflow catalog service; the engine only
//! reads them when a run is materialized.

pub mod types;

pub use types::{CaseTarget, RestartPolicy, StepDefinition, StepStructure, WorkflowDefinition};
