//! Database queries for the instance tables, organized by table.

pub mod step_instance;
pub mod workflow_instance;
