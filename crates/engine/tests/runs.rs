mod common;

use serde_json::json;

use common::{do_while, simple, sub_workflow, switch, with_input, with_retries, TestEngine};
use flowmesh_engine::{
    catalog::DeploymentState,
    definition::CaseTarget,
    dispatch::StepResult,
    engine::RunStatus,
    queue::Channel,
};

#[tokio::test]
async fn test_linear_run_with_one_retry_completes() {
    let engine = TestEngine::new();
    let extract = engine.deployed("extract").await;
    let transform = engine.deployed("transform").await;
    let load = engine.deployed("load").await;
    let wf = engine
        .workflow(
            "etl",
            vec![
                simple("extract", extract),
                with_retries(simple("transform", transform), 1),
                simple("load", load),
            ],
        )
        .await;

    let run = engine.start(wf, json!({"source": "s3://bucket"})).await;
    assert_eq!(engine.status(run).await, RunStatus::Running);

    let work = engine.expect_work("extract").await;
    assert_eq!(work.input_data["source"], "s3://bucket");
    engine.reply(&work, RunStatus::Completed, json!({"rows": 10})).await;
    engine.pump().await;

    let work = engine.expect_work("transform").await;
    assert_eq!(work.attempt, 1);
    engine
        .reply_with(&work, RunStatus::Failed, json!({}), Some("worker crashed"))
        .await;
    engine.pump().await;

    let retry = engine.expect_work("transform").await;
    assert_eq!(retry.attempt, 2);
    engine.reply(&retry, RunStatus::Completed, json!({"rows": 9})).await;
    engine.pump().await;

    let work = engine.expect_work("load").await;
    engine.reply(&work, RunStatus::Completed, json!({"loaded": 9})).await;
    engine.pump().await;

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::Completed);
    assert_eq!(snapshot.output_data["loaded"], 9);
    assert!(snapshot.failure_reason.is_none());

    let counts: Vec<(String, i32, i32)> = snapshot
        .run_steps
        .iter()
        .map(|s| (s.name.clone(), s.run_count, s.retry_count))
        .collect();
    assert_eq!(
        counts,
        vec![
            ("extract".to_string(), 1, 0),
            ("transform".to_string(), 2, 0),
            ("load".to_string(), 1, 0),
        ]
    );
    assert!(engine.take_work().await.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let engine = TestEngine::new();
    let f = engine.deployed("flaky").await;
    let wf = engine
        .workflow("flaky", vec![with_retries(simple("flaky", f), 1)])
        .await;

    let run = engine.start(wf, json!({})).await;
    for _ in 0..2 {
        let work = engine.expect_work("flaky").await;
        engine
            .reply_with(&work, RunStatus::TimedOut, json!({}), Some("deadline exceeded"))
            .await;
        engine.pump().await;
    }

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::TimedOut);
    assert_eq!(
        snapshot.failure_reason.as_deref(),
        Some("flaky: deadline exceeded")
    );
    assert!(engine.take_work().await.is_none());
}

#[tokio::test]
async fn test_formula_input_is_resolved_before_dispatch() {
    let engine = TestEngine::new();
    let f = engine.deployed("f").await;
    let wf = engine
        .workflow(
            "formulas",
            vec![
                simple("start", f),
                with_input(
                    simple("sum", f),
                    json!({"a": "@formula#[start.output.x] + 2#", "label": "plain"}),
                ),
            ],
        )
        .await;

    engine.start(wf, json!({})).await;
    let work = engine.expect_work("start").await;
    engine.reply(&work, RunStatus::Completed, json!({"x": 3})).await;
    engine.pump().await;

    let work = engine.expect_work("sum").await;
    assert_eq!(work.input_data["a"], 5);
    assert_eq!(work.input_data["label"], "plain");
}

#[tokio::test]
async fn test_switch_falls_back_to_default_case() {
    let engine = TestEngine::new();
    let start = engine.deployed("start").await;
    let branch_a = engine.deployed("branch-a").await;
    let fallback = engine.deployed("fallback").await;
    let wf = engine
        .workflow(
            "routing",
            vec![
                simple("start", start),
                switch(
                    "route",
                    "[start.output.branch]",
                    vec![
                        ("A", CaseTarget::Function { function_ref: branch_a }),
                        ("default", CaseTarget::Function { function_ref: fallback }),
                    ],
                ),
            ],
        )
        .await;

    let run = engine.start(wf, json!({})).await;
    let work = engine.expect_work("start").await;
    engine.reply(&work, RunStatus::Completed, json!({"branch": "Z"})).await;
    engine.pump().await;

    let work = engine.expect_work("route").await;
    assert_eq!(work.function_name, "fallback");

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_steps[1].selected_case_name.as_deref(), Some("default"));

    engine.reply(&work, RunStatus::Completed, json!({"routed": "default"})).await;
    engine.pump().await;
    assert_eq!(engine.status(run).await, RunStatus::Completed);
}

#[tokio::test]
async fn test_switch_without_match_or_default_fails() {
    let engine = TestEngine::new();
    let start = engine.deployed("start").await;
    let branch_a = engine.deployed("branch-a").await;
    let wf = engine
        .workflow(
            "routing",
            vec![
                simple("start", start),
                switch(
                    "route",
                    "[start.output.branch]",
                    vec![("A", CaseTarget::Function { function_ref: branch_a })],
                ),
            ],
        )
        .await;

    let run = engine.start(wf, json!({})).await;
    let work = engine.expect_work("start").await;
    engine.reply(&work, RunStatus::Completed, json!({"branch": "B"})).await;
    engine.pump().await;

    assert_eq!(engine.status(run).await, RunStatus::Failed);
    assert!(engine.take_work().await.is_none());
}

#[tokio::test]
async fn test_do_while_loops_until_stop_condition() {
    let engine = TestEngine::new();
    let counter = engine.deployed("counter").await;
    let wf = engine
        .workflow(
            "loop",
            vec![do_while("count", counter, "[self.output.counter] >= 3")],
        )
        .await;

    let run = engine.start(wf, json!({})).await;

    let mut dispatched = 0;
    while let Some(work) = engine.take_work().await {
        dispatched += 1;
        assert_eq!(work.attempt, dispatched);
        engine
            .reply(&work, RunStatus::Completed, json!({"counter": work.attempt}))
            .await;
        engine.pump().await;
        assert!(dispatched <= 3, "loop did not stop");
    }

    assert_eq!(dispatched, 3);
    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::Completed);
    assert_eq!(snapshot.run_steps[0].run_count, 3);
    assert_eq!(snapshot.output_data["counter"], 3);
}

#[tokio::test]
async fn test_sub_workflow_completion_reaches_parent_step() {
    let engine = TestEngine::new();
    let prepare = engine.deployed("prepare").await;
    let inner = engine.deployed("inner").await;
    let child_wf = engine.workflow("child", vec![simple("inner", inner)]).await;
    let parent_wf = engine
        .workflow(
            "parent",
            vec![simple("prepare", prepare), sub_workflow("nested", child_wf)],
        )
        .await;

    let run = engine.start(parent_wf, json!({})).await;
    let work = engine.expect_work("prepare").await;
    engine.reply(&work, RunStatus::Completed, json!({"ready": true})).await;
    engine.pump().await;

    let inner_work = engine.expect_work("inner").await;
    assert_ne!(inner_work.workflow_instance_id, run);
    let child_run = inner_work.workflow_instance_id;
    assert_eq!(engine.status(child_run).await, RunStatus::Running);
    assert_eq!(engine.status(run).await, RunStatus::Running);

    engine.reply(&inner_work, RunStatus::Completed, json!({"rows": 7})).await;
    engine.pump().await;

    assert_eq!(engine.status(child_run).await, RunStatus::Completed);
    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::Completed);
    assert_eq!(snapshot.run_steps[1].run_status, RunStatus::Completed);
    assert_eq!(snapshot.output_data["rows"], 7);

    let child = engine.runner.store().get_workflow_instance(child_run).await.unwrap();
    assert_eq!(child.parent_instance_uid, Some(run));
}

#[tokio::test]
async fn test_sub_workflow_as_first_step_hands_off_to_next_step() {
    let engine = TestEngine::new();
    let inner = engine.deployed("inner").await;
    let after = engine.deployed("after").await;
    let child_wf = engine.workflow("child", vec![simple("inner", inner)]).await;
    let parent_wf = engine
        .workflow(
            "parent",
            vec![
                sub_workflow("nested", child_wf),
                with_input(simple("after", after), json!({"doubled": "@formula#[nested.output.rows] * 2#"})),
            ],
        )
        .await;

    let run = engine.start(parent_wf, json!({"batch": 1})).await;
    assert_eq!(engine.status(run).await, RunStatus::Running);

    let inner_work = engine.expect_work("inner").await;
    assert_ne!(inner_work.workflow_instance_id, run);
    assert_eq!(inner_work.input_data["batch"], 1);
    engine.reply(&inner_work, RunStatus::Completed, json!({"rows": 2})).await;
    engine.pump().await;

    let work = engine.expect_work("after").await;
    assert_eq!(work.workflow_instance_id, run);
    assert_eq!(work.input_data["doubled"], 4);

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_steps[0].run_status, RunStatus::Completed);
    assert_eq!(snapshot.run_steps[0].run_count, 1);
    let nested = engine.runner.store().get_step_instance(snapshot.run_steps[0].uid).await.unwrap();
    assert_eq!(nested.output_data["rows"], 2);

    engine.reply(&work, RunStatus::Completed, json!({"done": true})).await;
    engine.pump().await;
    assert_eq!(engine.status(run).await, RunStatus::Completed);
}

#[tokio::test]
async fn test_switch_case_starts_sub_workflow() {
    let engine = TestEngine::new();
    let start = engine.deployed("start").await;
    let branch_a = engine.deployed("branch-a").await;
    let inner = engine.deployed("inner").await;
    let finish = engine.deployed("finish").await;
    let child_wf = engine.workflow("child", vec![simple("inner", inner)]).await;
    let wf = engine
        .workflow(
            "routing",
            vec![
                simple("start", start),
                switch(
                    "route",
                    "[start.output.branch]",
                    vec![
                        ("A", CaseTarget::Function { function_ref: branch_a }),
                        ("B", CaseTarget::SubWorkflow { sub_workflow_ref: child_wf }),
                    ],
                ),
                simple("finish", finish),
            ],
        )
        .await;

    let run = engine.start(wf, json!({})).await;
    let work = engine.expect_work("start").await;
    engine.reply(&work, RunStatus::Completed, json!({"branch": "B"})).await;
    engine.pump().await;

    let inner_work = engine.expect_work("inner").await;
    let child_run = inner_work.workflow_instance_id;
    assert_ne!(child_run, run);
    let child = engine.runner.store().get_workflow_instance(child_run).await.unwrap();
    assert_eq!(child.parent_instance_uid, Some(run));

    engine.reply(&inner_work, RunStatus::Completed, json!({"routed": "B"})).await;
    engine.pump().await;

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    let route = &snapshot.run_steps[1];
    assert_eq!(route.selected_case_name.as_deref(), Some("B"));
    assert_eq!(route.run_status, RunStatus::Completed);
    let route = engine.runner.store().get_step_instance(route.uid).await.unwrap();
    assert_eq!(route.output_data["routed"], "B");

    let work = engine.expect_work("finish").await;
    assert_eq!(work.workflow_instance_id, run);
    engine.reply(&work, RunStatus::Completed, json!({})).await;
    engine.pump().await;
    assert_eq!(engine.status(run).await, RunStatus::Completed);
    assert!(engine.take_work().await.is_none());
}

#[tokio::test]
async fn test_failed_sub_workflow_fails_parent() {
    let engine = TestEngine::new();
    let inner = engine.deployed("inner").await;
    let child_wf = engine.workflow("child", vec![simple("inner", inner)]).await;
    let parent_wf = engine
        .workflow("parent", vec![sub_workflow("nested", child_wf)])
        .await;

    let run = engine.start(parent_wf, json!({})).await;
    let work = engine.expect_work("inner").await;
    engine
        .reply_with(&work, RunStatus::FailedWithTerminalError, json!({}), Some("bad input"))
        .await;
    engine.pump().await;

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::FailedWithTerminalError);
    assert!(snapshot.failure_reason.unwrap().contains("bad input"));
}

#[tokio::test]
async fn test_duplicate_results_are_ignored() {
    let engine = TestEngine::new();
    let f = engine.deployed("f").await;
    let wf = engine
        .workflow("dupes", vec![simple("first", f), simple("second", f)])
        .await;

    let run = engine.start(wf, json!({})).await;
    let work = engine.expect_work("first").await;
    engine.reply(&work, RunStatus::Completed, json!({})).await;
    engine.reply(&work, RunStatus::Completed, json!({})).await;
    assert_eq!(engine.pump().await, 2);

    engine.expect_work("second").await;
    assert!(engine.take_work().await.is_none());

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_steps[0].run_count, 1);
}

#[tokio::test]
async fn test_result_after_stop_is_recorded_without_dispatch() {
    let engine = TestEngine::new();
    let f = engine.deployed("f").await;
    let wf = engine
        .workflow("stoppable", vec![simple("first", f), simple("second", f)])
        .await;

    let run = engine.start(wf, json!({})).await;
    let work = engine.expect_work("first").await;

    let stopped = engine.runner.stop(run).await.unwrap();
    assert_eq!(stopped.run_status, RunStatus::Stopped);

    engine.reply(&work, RunStatus::Completed, json!({"late": true})).await;
    engine.pump().await;

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::Stopped);
    assert_eq!(snapshot.run_steps[0].run_status, RunStatus::Completed);
    assert_eq!(snapshot.run_steps[1].run_status, RunStatus::New);
    assert!(engine.take_work().await.is_none());
}

#[tokio::test]
async fn test_lazy_deployment_moves_run_through_deploying() {
    let engine = TestEngine::with_deploy_polls(2);
    let f = engine.function("cold", DeploymentState::NotDeployed, true).await;
    let wf = engine.workflow("lazy", vec![simple("cold", f)]).await;

    let run = engine.start(wf, json!({})).await;
    assert_eq!(engine.status(run).await, RunStatus::DeployingFunctions);
    assert_eq!(engine.functions.deploy_requests().await, 1);

    let work = engine.wait_for_work(200).await.expect("step dispatched after deployment");
    assert_eq!(engine.status(run).await, RunStatus::Running);

    engine.reply(&work, RunStatus::Completed, json!({})).await;
    engine.pump().await;
    assert_eq!(engine.status(run).await, RunStatus::Completed);
}

#[tokio::test]
async fn test_eager_undeployed_function_fails_terminally() {
    let engine = TestEngine::new();
    let ready = engine.deployed("ready").await;
    let missing = engine.function("missing", DeploymentState::NotDeployed, false).await;
    let wf = engine
        .workflow("eager", vec![simple("ready", ready), simple("missing", missing)])
        .await;

    let run = engine.start(wf, json!({})).await;

    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::FailedWithTerminalError);
    assert!(snapshot.failure_reason.unwrap().contains("lazy deployment is disabled"));
    assert!(engine.take_work().await.is_none());
    assert_eq!(engine.functions.deploy_requests().await, 0);
}

#[tokio::test]
async fn test_push_mode_dispatch_failure_cancels_run() {
    use axum::{http::StatusCode, routing::post, Router};

    let router = Router::new().route("/invoke", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let engine = TestEngine::push_mode();
    let f = engine
        .function_at(
            "remote",
            DeploymentState::Deployed,
            false,
            Some(format!("http://{}/invoke", addr)),
        )
        .await;
    let wf = engine
        .workflow("pushed", vec![with_retries(simple("remote", f), 2)])
        .await;

    let run = engine.start(wf, json!({})).await;
    assert_eq!(engine.queue.pending(Channel::Work).await, 0);

    let results = engine.queue.published(Channel::Results).await;
    assert_eq!(results.len(), 1);
    let canceled: StepResult = serde_json::from_slice(&results[0]).unwrap();
    assert_eq!(canceled.run_status, RunStatus::Canceled);

    engine.pump().await;
    let snapshot = engine.runner.get_current_execution_state(run).await.unwrap();
    assert_eq!(snapshot.run_status, RunStatus::Canceled);
    assert!(snapshot.failure_reason.unwrap().contains("Gateway failed to dispatch"));
}
