//! Workflow execution engine.
//!
//! - **Runner**: the result-driven run state machine
//! - **Evaluator**: bracketed-reference expressions against a run's steps
//! - **Deployment**: waits for lazily deployed functions
//! - **Handler**: feeds queue messages into the runner
//! - **State**: status vocabulary and run snapshots

pub mod deployment;
pub mod evaluator;
pub mod handler;
pub mod runner;
pub mod state;

pub use deployment::DeploymentWatcher;
pub use evaluator::ExpressionEvaluator;
pub use handler::EngineHandler;
pub use runner::{RunnerSettings, WorkflowRunner};
pub use state::{ControlStructure, RunOrderLabel, RunSnapshot, RunStatus, StepSnapshot};
