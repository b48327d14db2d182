//! In-memory catalogs for local runs and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::definition::{StepDefinition, WorkflowDefinition};
use crate::error::{AppError, AppResult};

use super::{DeploymentState, FunctionCatalog, FunctionInfo, WorkflowCatalog};

/// Function catalog held in memory.
///
/// `deploy_function` marks the function DEPLOYING; with auto-complete
/// enabled it becomes DEPLOYED after `deploy_polls` lookups.
#[derive(Clone, Default)]
pub struct MemoryFunctionCatalog {
    functions: Arc<RwLock<HashMap<Uuid, FunctionInfo>>>,
    pending: Arc<RwLock<HashMap<Uuid, u32>>>,
    deploy_polls: Option<u32>,
}

impl MemoryFunctionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deployments complete after the given number of `get_function` calls.
    pub fn with_deploy_polls(mut self, polls: u32) -> Self {
        self.deploy_polls = Some(polls);
        self
    }

    pub async fn insert(&self, function: FunctionInfo) {
        self.functions.write().await.insert(function.uid, function);
    }

    pub async fn set_state(&self, uid: Uuid, state: DeploymentState) {
        if let Some(function) = self.functions.write().await.get_mut(&uid) {
            function.deployment_state = state;
        }
    }

    pub async fn deploy_requests(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[async_trait]
impl FunctionCatalog for MemoryFunctionCatalog {
    async fn get_function(&self, uid: Uuid) -> AppResult<FunctionInfo> {
        if let Some(remaining) = self.pending.write().await.get_mut(&uid) {
            if *remaining > 0 {
                *remaining -= 1;
                if *remaining == 0 {
                    self.set_state(uid, DeploymentState::Deployed).await;
                }
            }
        }

        self.functions
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Function {} not found", uid)))
    }

    async fn deploy_function(&self, uid: Uuid) -> AppResult<()> {
        if !self.functions.read().await.contains_key(&uid) {
            return Err(AppError::NotFound(format!("Function {} not found", uid)));
        }
        self.set_state(uid, DeploymentState::Deploying).await;
        self.pending
            .write()
            .await
            .insert(uid, self.deploy_polls.unwrap_or(0));
        Ok(())
    }
}

/// Workflow catalog held in memory.
#[derive(Clone, Default)]
pub struct MemoryWorkflowCatalog {
    workflows: Arc<RwLock<HashMap<Uuid, WorkflowDefinition>>>,
}

impl MemoryWorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workflow: WorkflowDefinition) {
        self.workflows.write().await.insert(workflow.uid, workflow);
    }
}

#[async_trait]
impl WorkflowCatalog for MemoryWorkflowCatalog {
    async fn get_workflow(&self, uid: Uuid) -> AppResult<WorkflowDefinition> {
        self.workflows
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Workflow {} not found", uid)))
    }

    async fn get_step_list(&self, workflow_uid: Uuid) -> AppResult<Vec<StepDefinition>> {
        Ok(self.get_workflow(workflow_uid).await?.steps)
    }
}
