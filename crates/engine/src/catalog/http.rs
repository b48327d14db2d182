//! HTTP clients for the function and workflow catalog services.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use crate::definition::{StepDefinition, WorkflowDefinition};
use crate::error::{AppError, AppResult};

use super::{FunctionCatalog, FunctionInfo, WorkflowCatalog};

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

async fn error_for(response: reqwest::Response, what: &str) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        AppError::NotFound(format!("{}: {}", what, body))
    } else {
        AppError::ExternalService(format!("{} failed with status {}: {}", what, status, body))
    }
}

/// Function catalog reached over HTTP.
#[derive(Clone)]
pub struct HttpFunctionCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFunctionCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl FunctionCatalog for HttpFunctionCatalog {
    async fn get_function(&self, uid: Uuid) -> AppResult<FunctionInfo> {
        let response = self
            .client
            .get(format!("{}/api/functions/{}", self.base_url, uid))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response, &format!("Function {}", uid)).await);
        }

        Ok(response.json().await?)
    }

    async fn deploy_function(&self, uid: Uuid) -> AppResult<()> {
        let response = self
            .client
            .post(format!("{}/api/functions/{}/deploy", self.base_url, uid))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response, &format!("Deploy function {}", uid)).await);
        }

        tracing::debug!(function_uid = %uid, "Deployment requested");
        Ok(())
    }
}

/// Workflow catalog reached over HTTP.
#[derive(Clone)]
pub struct HttpWorkflowCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkflowCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl WorkflowCatalog for HttpWorkflowCatalog {
    async fn get_workflow(&self, uid: Uuid) -> AppResult<WorkflowDefinition> {
        let response = self
            .client
            .get(format!("{}/api/workflows/{}", self.base_url, uid))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response, &format!("Workflow {}", uid)).await);
        }

        Ok(response.json().await?)
    }

    async fn get_step_list(&self, workflow_uid: Uuid) -> AppResult<Vec<StepDefinition>> {
        let response = self
            .client
            .get(format!("{}/api/workflows/{}/steps", self.base_url, workflow_uid))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for(response, &format!("Steps of workflow {}", workflow_uid)).await);
        }

        Ok(response.json().await?)
    }
}
