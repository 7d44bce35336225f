//! Shared mocks and fixtures for flowgate tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use flowgate_core::config::AppConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::plan::PlanNode;
use flowgate_core::traits::{NodeAdapter, NodeContext, NodeOutcome};

/// One scripted adapter response.
#[derive(Debug, Clone)]
pub enum Step {
    Ok(Value),
    Fail(String),
    /// Sleep, then succeed with `null`.
    Delay(Duration),
}

impl Step {
    pub fn ok(output: Value) -> Self {
        Self::Ok(output)
    }

    pub fn fail(message: &str) -> Self {
        Self::Fail(message.to_string())
    }

    pub fn delay(duration: Duration) -> Self {
        Self::Delay(duration)
    }
}

/// Adapter that replays scripted responses and records every call.
///
/// Responses come from a shared queue (`new`) or a fixed per-node table
/// (`by_node`); anything unscripted succeeds with `null`.
pub struct ScriptedAdapter {
    node_type: String,
    queue: Mutex<VecDeque<Step>>,
    per_node: HashMap<String, Step>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(node_type: &str, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            node_type: node_type.to_string(),
            queue: Mutex::new(steps.into()),
            per_node: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn by_node(node_type: &str, steps: Vec<(&str, Step)>) -> Arc<Self> {
        Arc::new(Self {
            node_type: node_type.to_string(),
            queue: Mutex::new(VecDeque::new()),
            per_node: steps
                .into_iter()
                .map(|(id, step)| (id.to_string(), step))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn always_ok(node_type: &str) -> Arc<Self> {
        Self::new(node_type, Vec::new())
    }

    /// Total number of `execute` calls.
    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == node_id)
            .count()
    }

    /// Node ids in call order.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self, node_id: &str) -> Step {
        if let Some(step) = self.per_node.get(node_id) {
            return step.clone();
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Ok(Value::Null))
    }
}

impl NodeAdapter for ScriptedAdapter {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, node: &PlanNode, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let node_id = node.id.clone();
        self.calls.lock().unwrap().push(node_id.clone());
        let step = self.next_step(&node_id);
        Box::pin(async move {
            match step {
                Step::Ok(output) => Ok(NodeOutcome::success(node_id, Some(output))),
                Step::Fail(message) => Ok(NodeOutcome::failed(node_id, message)),
                Step::Delay(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(NodeOutcome::success(node_id, None))
                }
            }
        })
    }
}

/// Adapter whose calls block until the test releases them.
pub struct BlockingAdapter {
    node_type: String,
    permits: Semaphore,
    started: AtomicUsize,
}

impl BlockingAdapter {
    pub fn new(node_type: &str) -> Arc<Self> {
        Arc::new(Self {
            node_type: node_type.to_string(),
            permits: Semaphore::new(0),
            started: AtomicUsize::new(0),
        })
    }

    /// Let `n` blocked (or future) calls complete.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Calls that have entered `execute`.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` calls have started.
    pub async fn wait_started(&self, n: usize) {
        while self.started() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl NodeAdapter for BlockingAdapter {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, node: &PlanNode, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let node_id = node.id.clone();
        self.started.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(FlowgateError::Cancelled),
                permit = self.permits.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    Ok(NodeOutcome::success(node_id, Some(json!("released"))))
                }
            }
        })
    }
}

/// A sequence plan whose children are `local_task` nodes with the given ids.
pub fn plan_from(ids: &[&str]) -> Value {
    plan_named("fixture", ids)
}

pub fn plan_named(plan_id: &str, ids: &[&str]) -> Value {
    let mut nodes = vec![json!({"id": "root", "type": "sequence", "children": ids})];
    nodes.extend(
        ids.iter()
            .map(|id| json!({"id": id, "type": "local_task", "command": format!("echo {}", id)})),
    );
    json!({"id": plan_id, "version": "1", "entry": "root", "nodes": nodes})
}

/// A single-task plan with an explicit `schedule.concurrency`.
pub fn plan_with_policy(plan_id: &str, policy: &str) -> Value {
    json!({
        "id": plan_id,
        "version": "1",
        "entry": "work",
        "schedule": {"concurrency": policy},
        "nodes": [{"id": "work", "type": "local_task", "command": "true"}]
    })
}

/// Write `toml` to a temp file and return (dir guard, path).
pub fn temp_config(toml: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowgate.toml");
    std::fs::write(&path, toml).unwrap();
    (dir, path)
}

/// Config rooted in a temp data dir.
pub fn test_config() -> (tempfile::TempDir, AppConfig) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.runtime.data_dir = dir.path().display().to_string();
    (dir, config)
}
