use std::sync::Arc;

use serde_json::{json, Value};

use flowgate_core::config::AppConfig;
use flowgate_core::event::EventBus;
use flowgate_core::plan::PlanContext;
use flowgate_core::types::{ApprovalDecision, ApprovalStatus, ExecutionStatus};
use flowgate_engine::{
    AdapterRegistry, ApprovalBroker, ExecutionManager, Executor, ExecutorOptions, GateOptions,
};
use flowgate_store::{ApprovalStore, CheckpointStore, ExecutionStore};
use flowgate_test_utils::test_config;

struct Runtime {
    _dir: tempfile::TempDir,
    config: AppConfig,
    bus: Arc<EventBus>,
    broker: Arc<ApprovalBroker>,
    manager: ExecutionManager,
}

/// The same wiring the binary uses, with only the built-in adapters.
fn runtime() -> Runtime {
    let (dir, config) = test_config();
    let bus = Arc::new(EventBus::new(1024));
    let approvals = Arc::new(ApprovalStore::open(&config.approvals_path()).unwrap());
    let broker = Arc::new(ApprovalBroker::new(approvals, bus.clone()));
    let checkpoints = Arc::new(CheckpointStore::open(&config.checkpoint_db_path()).unwrap());
    let executor = Arc::new(Executor::new(
        Arc::new(AdapterRegistry::with_builtins()),
        broker.clone(),
        bus.clone(),
        Some(checkpoints),
        ExecutorOptions {
            approvals: config.approvals.clone(),
            checkpoint: true,
        },
    ));
    let store = Arc::new(ExecutionStore::open(&config.executions_dir()).unwrap());
    let manager = ExecutionManager::new(
        executor,
        Some(store),
        bus.clone(),
        GateOptions {
            max_running: config.runtime.max_concurrent_executions,
            default_policy: config.runtime.default_concurrency,
        },
    );
    Runtime {
        _dir: dir,
        config,
        bus,
        broker,
        manager,
    }
}

fn plan(raw: Value) -> Arc<PlanContext> {
    Arc::new(PlanContext::parse(&raw).expect("valid plan"))
}

#[tokio::test]
async fn test_shell_plan_runs_to_completion() {
    let rt = runtime();
    let p = plan(json!({
        "id": "release",
        "version": 2,
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["greet", "check", "fanout"]},
            {"id": "greet", "type": "local_task", "command": "echo hello"},
            {"id": "check", "type": "conditional",
             "expression": "greet.output.stdout contains \"hello\"",
             "whenTrue": ["yes"], "whenFalse": ["no"]},
            {"id": "yes", "type": "local_task", "command": "echo took-true"},
            {"id": "no", "type": "local_task", "command": "echo took-false"},
            {"id": "fanout", "type": "parallel", "children": ["left", "right"]},
            {"id": "left", "type": "local_task", "command": "echo left"},
            {"id": "right", "type": "local_task", "command": "echo right"}
        ]
    }));

    let started = rt.manager.submit(p, json!({})).unwrap();
    let record = rt.manager.wait(&started.id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Success, "{:?}", record.error);
    assert_eq!(record.outputs["greet.output"]["stdout"], "hello\n");
    assert_eq!(record.outputs["yes.output"]["stdout"], "took-true\n");
    assert!(!record.outputs.contains_key("no.output"));
    assert_eq!(record.outputs["left.output"]["exitCode"], 0);
    assert_eq!(record.outputs["right.output"]["exitCode"], 0);
    assert!(record.finished_at.is_some());

    // The record survives on disk.
    let store = ExecutionStore::open(&rt.config.executions_dir()).unwrap();
    let persisted = store.load(&record.id).unwrap().expect("persisted record");
    assert_eq!(persisted.status, ExecutionStatus::Success);
    assert_eq!(persisted.plan_id, "release");
}

#[tokio::test]
async fn test_inputs_drive_branching() {
    let rt = runtime();
    let raw = json!({
        "id": "deploy",
        "entry": "route",
        "nodes": [
            {"id": "route", "type": "conditional", "expression": "input.env == \"prod\"",
             "whenTrue": ["careful"], "whenFalse": ["quick"]},
            {"id": "careful", "type": "local_task", "command": "echo careful"},
            {"id": "quick", "type": "local_task", "command": "echo quick"}
        ]
    });

    let prod = rt.manager.submit(plan(raw.clone()), json!({"env": "prod"})).unwrap();
    let prod = rt.manager.wait(&prod.id).await.unwrap();
    assert!(prod.outputs.contains_key("careful.output"));
    assert!(!prod.outputs.contains_key("quick.output"));

    let dev = rt.manager.submit(plan(raw), json!({"env": "dev"})).unwrap();
    let dev = rt.manager.wait(&dev.id).await.unwrap();
    assert!(dev.outputs.contains_key("quick.output"));
}

#[tokio::test]
async fn test_failing_command_fails_execution() {
    let rt = runtime();
    let p = plan(json!({
        "id": "broken",
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["boom", "never"]},
            {"id": "boom", "type": "local_task", "command": "echo nope >&2; exit 3",
             "retryPolicy": {"maxAttempts": 2}},
            {"id": "never", "type": "local_task", "command": "echo unreachable"}
        ]
    }));

    let started = rt.manager.submit(p, json!({})).unwrap();
    let record = rt.manager.wait(&started.id).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let error = record.error.unwrap();
    assert!(error.contains("exit code 3"), "{}", error);
    assert!(!record.outputs.contains_key("never.output"));
}

#[tokio::test]
async fn test_edge_list_plan_with_approval() {
    let rt = runtime();
    let p = plan(json!({
        "id": "gated",
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence"},
            {"id": "gate", "type": "human_approval", "prompt": "Proceed?", "requiresApproval": true},
            {"id": "ship", "type": "local_task", "command": "echo shipped"}
        ],
        "edges": [
            {"source": "root", "target": "gate"},
            {"source": "root", "target": "ship"}
        ]
    }));

    let mut events = rt.bus.subscribe();
    let started = rt.manager.submit(p, json!({})).unwrap();

    let approval_id = loop {
        let env = events.recv().await.unwrap();
        if env.event == "approval:requested" {
            assert_eq!(env.execution_id.as_deref(), Some(started.id.as_str()));
            break env.payload["id"].as_str().unwrap().to_string();
        }
    };
    assert_eq!(rt.broker.list_pending().unwrap().len(), 1);

    rt.broker
        .decide(
            &approval_id,
            ApprovalDecision::approved("release-manager").with_comment("looks good"),
        )
        .await
        .unwrap();

    let record = rt.manager.wait(&started.id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Success);
    assert_eq!(record.outputs["ship.output"]["stdout"], "shipped\n");

    let store = ApprovalStore::open(&rt.config.approvals_path()).unwrap();
    assert!(store.list_pending().unwrap().is_empty());
    let completed = store.list_completed().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].request.id, approval_id);
    assert_eq!(completed[0].status, ApprovalStatus::Approved);
    assert_eq!(completed[0].comment.as_deref(), Some("looks good"));
}

#[tokio::test]
async fn test_dry_run_checks_without_running() {
    let rt = runtime();
    let missing_dir = rt.config.data_dir().join("does-not-exist");
    let p = plan(json!({
        "id": "dry",
        "entry": "root",
        "nodes": [
            {"id": "root", "type": "sequence", "children": ["ok", "bad_dir", "mystery"]},
            {"id": "ok", "type": "local_task", "command": "touch should-not-exist"},
            {"id": "bad_dir", "type": "local_task", "command": "true",
             "workingDir": missing_dir.display().to_string()},
            {"id": "mystery", "type": "mcp_tool", "server": "search", "tool": "query"}
        ]
    }));

    let reports = rt.manager.executor().dry_run(&p).await;
    let by_id = |id: &str| reports.iter().find(|r| r.node_id == id).unwrap().clone();

    assert!(by_id("ok").ok);
    assert!(!by_id("bad_dir").ok);
    // No mcp_tool adapter is registered in this runtime.
    assert!(!by_id("mystery").ok);
    assert!(rt.manager.list().unwrap().is_empty());
}
