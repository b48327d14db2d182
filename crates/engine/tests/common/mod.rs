//! In-process engine used by the integration tests.
//!
//! Everything runs on the memory queue, repository and catalogs. Tests
//! play the executor: they take work requests off the work channel and
//! publish results, then `pump` feeds the result and deployment channels
//! through the same handler the server consumes them with.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use flowmesh_engine::{
    catalog::{DeploymentState, FunctionInfo, MemoryFunctionCatalog, MemoryWorkflowCatalog},
    config::DispatchMode,
    definition::{CaseTarget, RestartPolicy, StepDefinition, StepStructure, WorkflowDefinition},
    dispatch::{DispatchGateway, StepResult, WorkRequest},
    engine::{EngineHandler, RunStatus, RunnerSettings, WorkflowRunner},
    queue::{self, Channel, Disposition, MemoryQueue, MessageHandler},
    store::{DataMap, InstanceStore, MemoryInstanceRepository},
};

pub struct TestEngine {
    pub runner: Arc<WorkflowRunner>,
    pub queue: MemoryQueue,
    pub repository: MemoryInstanceRepository,
    pub functions: MemoryFunctionCatalog,
    pub workflows: MemoryWorkflowCatalog,
    handler: EngineHandler,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::build(DispatchMode::Queue, MemoryFunctionCatalog::new())
    }

    /// Engine whose lazily deployed functions become ready after `polls`
    /// catalog lookups.
    pub fn with_deploy_polls(polls: u32) -> Self {
        Self::build(
            DispatchMode::Queue,
            MemoryFunctionCatalog::new().with_deploy_polls(polls),
        )
    }

    pub fn push_mode() -> Self {
        Self::build(DispatchMode::Push, MemoryFunctionCatalog::new())
    }

    fn build(mode: DispatchMode, functions: MemoryFunctionCatalog) -> Self {
        let queue = MemoryQueue::new();
        let repository = MemoryInstanceRepository::new();
        let workflows = MemoryWorkflowCatalog::new();

        let store = InstanceStore::new(Arc::new(repository.clone()), Arc::new(queue.clone()));
        let gateway = DispatchGateway::new(
            Arc::new(queue.clone()),
            mode,
            "http://engine.test/api/callback",
            Duration::from_secs(2),
        );
        let settings = RunnerSettings {
            deployment_timeout: Duration::from_secs(5),
            deployment_poll_interval: Duration::from_millis(5),
            max_deployment_watchers: 4,
            retention_keep_days: 7,
            retention_max_count: 30,
        };
        let runner = Arc::new(WorkflowRunner::new(
            store,
            gateway,
            Arc::new(functions.clone()),
            Arc::new(workflows.clone()),
            Arc::new(queue.clone()),
            settings,
        ));

        Self {
            handler: EngineHandler::new(runner.clone()),
            runner,
            queue,
            repository,
            functions,
            workflows,
        }
    }

    /// Register a function and return its uid.
    pub async fn function(&self, name: &str, state: DeploymentState, lazy: bool) -> Uuid {
        self.function_at(name, state, lazy, None).await
    }

    pub async fn function_at(
        &self,
        name: &str,
        state: DeploymentState,
        lazy: bool,
        service_url: Option<String>,
    ) -> Uuid {
        let uid = Uuid::new_v4();
        self.functions
            .insert(FunctionInfo {
                uid,
                name: name.to_string(),
                function_type: "python".to_string(),
                deployment_state: state,
                lazy_deployment: lazy,
                service_url,
                cpu_request: None,
                memory_request: None,
            })
            .await;
        uid
    }

    pub async fn deployed(&self, name: &str) -> Uuid {
        self.function(name, DeploymentState::Deployed, false).await
    }

    /// Register a workflow; steps run in the order given.
    pub async fn workflow(&self, name: &str, steps: Vec<StepDefinition>) -> Uuid {
        let uid = Uuid::new_v4();
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| StepDefinition {
                execution_order: i as i32 + 1,
                ..step
            })
            .collect();
        self.workflows
            .insert(WorkflowDefinition {
                uid,
                name: name.to_string(),
                description: None,
                steps,
                restart_policy: RestartPolicy::Never,
                timeout: None,
            })
            .await;
        uid
    }

    pub async fn start(&self, workflow_uid: Uuid, input: Value) -> Uuid {
        self.runner
            .start_workflow(workflow_uid, object(input), None, None)
            .await
            .expect("run starts")
            .run_uid
    }

    pub async fn take_work(&self) -> Option<WorkRequest> {
        let payload = self.queue.take(Channel::Work).await?;
        Some(queue::decode(&payload).expect("work request decodes"))
    }

    pub async fn expect_work(&self, step_name: &str) -> WorkRequest {
        let work = self.take_work().await.expect("a pending work request");
        let step = self
            .runner
            .store()
            .get_step_instance(work.step_instance_id)
            .await
            .expect("dispatched step exists");
        assert_eq!(step.name, step_name, "unexpected step dispatched");
        work
    }

    /// Publish the executor's answer to `work`.
    pub async fn reply(&self, work: &WorkRequest, status: RunStatus, output: Value) {
        self.reply_with(work, status, output, None).await
    }

    pub async fn reply_with(&self, work: &WorkRequest, status: RunStatus, output: Value, reason: Option<&str>) {
        let result = StepResult {
            step_instance_id: work.step_instance_id,
            workflow_instance_id: work.workflow_instance_id,
            run_status: status,
            failure_reason: reason.map(str::to_string),
            call_back_url: None,
            input_data: work.input_data.clone(),
            output_data: object(output),
            attempt: Some(work.attempt),
        };
        queue::publish_json(&self.queue, Channel::Results, &result)
            .await
            .expect("result published");
    }

    /// Handle every pending result and deployment message, including the
    /// ones produced while handling. Returns how many were handled.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for channel in [Channel::Results, Channel::Deployments] {
                while let Some(payload) = self.queue.take(channel).await {
                    let disposition = self.handler.handle(channel, &payload).await;
                    assert_eq!(disposition, Disposition::Ack, "message on {} not acked", channel);
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Pump until a work request shows up or the wait runs out.
    pub async fn wait_for_work(&self, attempts: usize) -> Option<WorkRequest> {
        for _ in 0..attempts {
            self.pump().await;
            if let Some(work) = self.take_work().await {
                return Some(work);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    pub async fn status(&self, run_uid: Uuid) -> RunStatus {
        self.runner
            .get_current_execution_state(run_uid)
            .await
            .expect("run exists")
            .run_status
    }
}

pub fn object(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        Value::Null => DataMap::new(),
        other => panic!("expected a JSON object, got {}", other),
    }
}

fn step(name: &str, structure: StepStructure) -> StepDefinition {
    StepDefinition {
        uid: Uuid::new_v4(),
        name: name.to_string(),
        execution_order: 0,
        retry_count: 0,
        input_data: DataMap::new(),
        structure,
    }
}

pub fn simple(name: &str, function_ref: Uuid) -> StepDefinition {
    step(name, StepStructure::Simple { function_ref })
}

pub fn with_retries(mut definition: StepDefinition, retry_count: i32) -> StepDefinition {
    definition.retry_count = retry_count;
    definition
}

pub fn with_input(mut definition: StepDefinition, input: Value) -> StepDefinition {
    definition.input_data = object(input);
    definition
}

pub fn do_while(name: &str, function_ref: Uuid, stop_condition: &str) -> StepDefinition {
    step(
        name,
        StepStructure::DoWhile {
            function_ref,
            stop_condition: stop_condition.to_string(),
        },
    )
}

pub fn sub_workflow(name: &str, sub_workflow_ref: Uuid) -> StepDefinition {
    step(name, StepStructure::SubWorkflow { sub_workflow_ref })
}

pub fn switch(name: &str, expression: &str, cases: Vec<(&str, CaseTarget)>) -> StepDefinition {
    let decision_cases: BTreeMap<String, CaseTarget> = cases
        .into_iter()
        .map(|(case, target)| (case.to_string(), target))
        .collect();
    step(
        name,
        StepStructure::Switch {
            switch_expression: expression.to_string(),
            decision_cases,
        },
    )
}
