//! Clients for the catalog services that own workflow and function
//! definitions. The engine only reads definitions and triggers
//! deployments; everything else about them lives elsewhere.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{StepDefinition, WorkflowDefinition};
use crate::error::AppResult;

pub use http::{HttpFunctionCatalog, HttpWorkflowCatalog};
pub use memory::{MemoryFunctionCatalog, MemoryWorkflowCatalog};

/// Deployment state reported by the function catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    Deployed,
    NotDeployed,
    Deploying,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Function as described by the function catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionInfo {
    pub uid: Uuid,
    pub name: String,
    #[serde(rename = "type", default)]
    pub function_type: String,
    pub deployment_state: DeploymentState,
    #[serde(default)]
    pub lazy_deployment: bool,
    #[serde(default)]
    pub service_url: Option<String>,
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
}

impl FunctionInfo {
    pub fn is_deployed(&self) -> bool {
        self.deployment_state == DeploymentState::Deployed
    }
}

#[async_trait]
pub trait FunctionCatalog: Send + Sync {
    async fn get_function(&self, uid: Uuid) -> AppResult<FunctionInfo>;

    /// Ask the catalog to deploy a function. Returns once the request is
    /// accepted; readiness is observed by polling `get_function`.
    async fn deploy_function(&self, uid: Uuid) -> AppResult<()>;
}

#[async_trait]
pub trait WorkflowCatalog: Send + Sync {
    async fn get_workflow(&self, uid: Uuid) -> AppResult<WorkflowDefinition>;

    async fn get_step_list(&self, workflow_uid: Uuid) -> AppResult<Vec<StepDefinition>>;
}
