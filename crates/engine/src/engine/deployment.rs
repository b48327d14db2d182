//! Deployment watcher for lazily deployed functions.
//!
//! A run whose functions are not yet deployed waits in
//! DEPLOYING_FUNCTIONS while a watcher polls the function catalog. The
//! watcher never holds a lock across its sleep, gives up at its deadline
//! and stops early once the run leaves DEPLOYING_FUNCTIONS (stopped by an
//! operator, for instance). Its verdict goes out on the deployment
//! channel so that the runner picks it up like any other message. When
//! the verdict cannot be published the watcher fails the run itself, as
//! nothing else would ever move it out of DEPLOYING_FUNCTIONS.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::catalog::{DeploymentState, FunctionCatalog};
use crate::dispatch::DeploymentOutcome;
use crate::engine::state::RunStatus;
use crate::error::{AppError, AppResult};
use crate::queue::{self, Channel, QueueClient};
use crate::result_ext::ResultExt;
use crate::store::InstanceStore;

/// Publish attempts for a deployment outcome before the run is failed.
const PUBLISH_ATTEMPTS: u32 = 5;
const MAX_PUBLISH_BACKOFF: Duration = Duration::from_secs(30);

enum Wait {
    Ready,
    Abandoned,
}

/// Spawns bounded deployment waits.
#[derive(Clone)]
pub struct DeploymentWatcher {
    functions: Arc<dyn FunctionCatalog>,
    store: InstanceStore,
    queue: Arc<dyn QueueClient>,
    permits: Arc<Semaphore>,
    deadline: Duration,
    poll_interval: Duration,
}

impl DeploymentWatcher {
    pub fn new(
        functions: Arc<dyn FunctionCatalog>,
        store: InstanceStore,
        queue: Arc<dyn QueueClient>,
        max_watchers: usize,
        deadline: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            functions,
            store,
            queue,
            permits: Arc::new(Semaphore::new(max_watchers.max(1))),
            deadline,
            poll_interval,
        }
    }

    /// Watch `function_uids` on behalf of run `workflow_instance_uid`.
    pub fn spawn(&self, workflow_instance_uid: Uuid, function_uids: Vec<Uuid>) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move { watcher.watch(workflow_instance_uid, function_uids).await })
    }

    async fn watch(&self, workflow_instance_uid: Uuid, function_uids: Vec<Uuid>) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let waited = tokio::time::timeout(
            self.deadline,
            self.wait_until_deployed(workflow_instance_uid, function_uids),
        )
        .await;

        let outcome = match waited {
            Ok(Ok(Wait::Ready)) => DeploymentOutcome {
                workflow_instance_id: workflow_instance_uid,
                ready: true,
                failure_reason: None,
            },
            Ok(Ok(Wait::Abandoned)) => {
                tracing::info!(
                    workflow_instance_uid = %workflow_instance_uid,
                    "Run left DEPLOYING_FUNCTIONS, deployment watch abandoned"
                );
                return;
            }
            Ok(Err(e)) => DeploymentOutcome {
                workflow_instance_id: workflow_instance_uid,
                ready: false,
                failure_reason: Some(e.to_string()),
            },
            Err(_) => DeploymentOutcome {
                workflow_instance_id: workflow_instance_uid,
                ready: false,
                failure_reason: Some(format!(
                    "Functions were not deployed within {}s",
                    self.deadline.as_secs()
                )),
            },
        };

        tracing::info!(
            workflow_instance_uid = %workflow_instance_uid,
            ready = outcome.ready,
            "Deployment watch finished"
        );

        self.report(&outcome).await;
    }

    /// Publish `outcome`, backing off between attempts while the run still
    /// waits on it.
    async fn report(&self, outcome: &DeploymentOutcome) {
        let run_uid = outcome.workflow_instance_id;
        let mut backoff = self.poll_interval;

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match queue::publish_json(self.queue.as_ref(), Channel::Deployments, outcome).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(
                    workflow_instance_uid = %run_uid,
                    attempt,
                    error = %e,
                    "Failed to publish deployment outcome"
                ),
            }

            match self.store.get_workflow_instance(run_uid).await {
                Ok(run) if run.run_status != RunStatus::DeployingFunctions => return,
                Ok(_) => {}
                Err(e) => tracing::warn!(workflow_instance_uid = %run_uid, error = %e, "Failed to read run"),
            }

            if attempt < PUBLISH_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_PUBLISH_BACKOFF);
            }
        }

        self.fail_run(outcome)
            .await
            .swallow("failing run with an undeliverable deployment outcome");
    }

    async fn fail_run(&self, outcome: &DeploymentOutcome) -> AppResult<()> {
        let run_uid = outcome.workflow_instance_id;
        let failed = self
            .store
            .transition_workflow_status(
                run_uid,
                RunStatus::DeployingFunctions,
                RunStatus::FailedWithTerminalError,
            )
            .await?;
        if !failed {
            return Ok(());
        }

        let reason = match &outcome.failure_reason {
            Some(reason) => format!("Deployment outcome could not be delivered: {}", reason),
            None => "Deployment outcome could not be delivered".to_string(),
        };
        let run = self.store.get_workflow_instance(run_uid).await?;
        self.store.set_workflow_end_time(run_uid).await?;
        self.store.record_error(run_uid, &run.name, &reason).await?;
        tracing::warn!(workflow_instance_uid = %run_uid, reason = %reason, "Run failed while deploying");
        Ok(())
    }

    async fn wait_until_deployed(
        &self,
        workflow_instance_uid: Uuid,
        mut pending: Vec<Uuid>,
    ) -> AppResult<Wait> {
        loop {
            let run = self.store.get_workflow_instance(workflow_instance_uid).await?;
            if run.run_status != RunStatus::DeployingFunctions {
                return Ok(Wait::Abandoned);
            }

            let mut still_pending = Vec::with_capacity(pending.len());
            for uid in pending {
                let function = self.functions.get_function(uid).await?;
                match function.deployment_state {
                    DeploymentState::Deployed => {}
                    DeploymentState::Failed => {
                        return Err(AppError::ExternalService(format!(
                            "Deployment of function '{}' failed",
                            function.name
                        )));
                    }
                    _ => still_pending.push(uid),
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                return Ok(Wait::Ready);
            }

            tracing::debug!(
                workflow_instance_uid = %workflow_instance_uid,
                pending = pending.len(),
                "Waiting for functions to deploy"
            );
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
