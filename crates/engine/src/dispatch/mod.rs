//! Outbound work and inbound results.

pub mod gateway;
pub mod messages;

pub use gateway::DispatchGateway;
pub use messages::{CallbackBody, DeploymentOutcome, PushRequest, StepResult, WorkRequest};
