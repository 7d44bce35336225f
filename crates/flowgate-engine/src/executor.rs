use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowgate_core::config::ApprovalsConfig;
use flowgate_core::error::FlowgateError;
use flowgate_core::event::EventBus;
use flowgate_core::plan::{LoopMode, NodeKind, PlanContext, PlanNode, StateMap};
use flowgate_core::traits::{NodeAdapter, NodeContext};
use flowgate_core::types::{
    ApprovalDecision, ApprovalStatus, ExecutionRecord, ExecutionStatus, LogLevel, LogLinePayload,
    NodeEventPayload, NodeStatus, PendingApprovalEntry,
};
use flowgate_store::{Checkpoint, CheckpointStore};

use crate::approval::ApprovalBroker;
use crate::registry::AdapterRegistry;

/// State key holding the execution's inputs.
pub const INPUT_KEY: &str = "input";

/// Who the engine records as the decider when it resolves an approval itself.
const TIMEOUT_DECIDER: &str = "system:timeout";
const CANCEL_DECIDER: &str = "system:cancel";

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub approvals: ApprovalsConfig,
    /// Persist a checkpoint after every settled node.
    pub checkpoint: bool,
}

/// Per-node result of a dry run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunReport {
    pub node_id: String,
    pub node_type: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a subtree settled.
#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Ok,
    Failed { node: String, error: String },
    Cancelled,
}

impl Flow {
    fn failed(node: &str, error: impl Into<String>) -> Self {
        Self::Failed {
            node: node.to_string(),
            error: error.into(),
        }
    }
}

/// Outcome of one adapter attempt.
enum Attempt {
    Success(Option<Value>),
    Failed(String),
    Cancelled,
}

/// Walks a validated plan, dispatching leaves to adapters.
pub struct Executor {
    registry: Arc<AdapterRegistry>,
    broker: Arc<ApprovalBroker>,
    event_bus: Arc<EventBus>,
    checkpoints: Option<Arc<CheckpointStore>>,
    options: ExecutorOptions,
}

impl Executor {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        broker: Arc<ApprovalBroker>,
        event_bus: Arc<EventBus>,
        checkpoints: Option<Arc<CheckpointStore>>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            broker,
            event_bus,
            checkpoints,
            options,
        }
    }

    pub fn broker(&self) -> &Arc<ApprovalBroker> {
        &self.broker
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointStore>> {
        self.checkpoints.as_ref()
    }

    /// Run `record` (already marked running) to a terminal status.
    ///
    /// `resume` restores shared state and skips nodes a previous run completed.
    pub async fn execute(
        &self,
        plan: Arc<PlanContext>,
        mut record: ExecutionRecord,
        inputs: Value,
        cancel: CancellationToken,
        resume: Option<Checkpoint>,
    ) -> ExecutionRecord {
        let (state, completed) = match resume {
            Some(cp) => {
                let state = cp.state().unwrap_or_else(|e| {
                    warn!(execution_id = %record.id, error = %e, "Checkpoint state unreadable, starting fresh");
                    StateMap::new()
                });
                info!(
                    execution_id = %record.id,
                    completed = cp.completed_nodes.len(),
                    "Resuming from checkpoint"
                );
                (state, cp.completed_nodes.into_iter().collect())
            }
            None => {
                let mut state = StateMap::new();
                state.insert(INPUT_KEY.to_string(), inputs);
                (state, HashSet::new())
            }
        };

        let run = Run {
            exec: self,
            plan: &plan,
            execution_id: record.id.clone(),
            cancel,
            state: Mutex::new(state),
            completed: Mutex::new(completed),
            last_node: Mutex::new(record.last_node_id.clone()),
        };

        info!(execution_id = %record.id, plan_id = %plan.plan.id, "Execution started");
        let flow = run.node(plan.entry(), false).await;

        let (status, error) = match flow {
            Flow::Ok => (ExecutionStatus::Success, None),
            Flow::Failed { node, error } => {
                (ExecutionStatus::Failed, Some(format!("{}: {}", node, error)))
            }
            Flow::Cancelled => (ExecutionStatus::Cancelled, None),
        };

        record.outputs = run.outputs();
        record.last_node_id = run.last_node.lock().ok().and_then(|l| l.clone());
        record.finish(status, error);

        match record.status {
            ExecutionStatus::Success => info!(execution_id = %record.id, "Execution succeeded"),
            ExecutionStatus::Cancelled => info!(execution_id = %record.id, "Execution cancelled"),
            _ => error!(
                execution_id = %record.id,
                error = record.error.as_deref().unwrap_or(""),
                "Execution failed"
            ),
        }

        if record.status == ExecutionStatus::Success {
            if let Some(store) = &self.checkpoints {
                if let Err(e) = store.delete(&record.id) {
                    warn!(execution_id = %record.id, error = %e, "Failed to clear checkpoint");
                }
            }
        }
        record
    }

    /// Validate every action node against its adapter without side effects.
    pub async fn dry_run(&self, plan: &PlanContext) -> Vec<DryRunReport> {
        let mut reports = Vec::with_capacity(plan.plan.nodes.len());
        for node in &plan.plan.nodes {
            let error = if node.kind.is_action() {
                match self.registry.get(node.type_name()) {
                    None => Some(FlowgateError::AdapterNotFound(node.type_name().into()).to_string()),
                    Some(adapter) => adapter.dry_run(node).await.err().map(|e| e.to_string()),
                }
            } else {
                None
            };
            reports.push(DryRunReport {
                node_id: node.id.clone(),
                node_type: node.type_name().to_string(),
                ok: error.is_none(),
                error,
            });
        }
        reports
    }

    fn needs_approval(&self, node: &PlanNode) -> bool {
        node.requires_approval || node.risk_level >= self.options.approvals.require_at_risk
    }
}

/// State of one in-flight execution.
struct Run<'a> {
    exec: &'a Executor,
    plan: &'a PlanContext,
    execution_id: String,
    cancel: CancellationToken,
    state: Mutex<StateMap>,
    /// Leaves, approvals, and loops that already succeeded outside any loop body.
    completed: Mutex<HashSet<String>>,
    last_node: Mutex<Option<String>>,
}

impl<'a> Run<'a> {
    fn node<'b>(&'b self, id: &'b str, in_loop: bool) -> BoxFuture<'b, Flow> {
        async move {
            if self.cancel.is_cancelled() {
                return Flow::Cancelled;
            }
            let Some(node) = self.plan.node(id) else {
                return Flow::failed(id, "node not found");
            };
            if !in_loop && self.is_completed(id) {
                debug!(execution_id = %self.execution_id, node_id = %id, "Skipping completed node");
                return Flow::Ok;
            }
            self.set_last(id);

            let flow = match &node.kind {
                NodeKind::Sequence { children } => self.sequence(children, in_loop).await,
                NodeKind::Parallel { children } => self.parallel(children, in_loop).await,
                NodeKind::Conditional {
                    when_true,
                    when_false,
                    ..
                } => self.conditional(node, when_true, when_false, in_loop).await,
                NodeKind::Loop {
                    body,
                    mode,
                    max_iterations,
                    ..
                } => self.repeat(node, body, *mode, *max_iterations).await,
                NodeKind::HumanApproval { .. } => {
                    if self.exec.needs_approval(node) {
                        self.await_approval(node, approval_timeout(node, &self.exec.options))
                            .await
                    } else {
                        self.node_event(node, NodeStatus::Skipped, 1, None);
                        Flow::Ok
                    }
                }
                NodeKind::LocalTask { .. }
                | NodeKind::AgentInvocation { .. }
                | NodeKind::McpTool { .. }
                | NodeKind::ExternalService { .. } => self.action(node).await,
            };

            let atomic = !matches!(
                node.kind,
                NodeKind::Sequence { .. } | NodeKind::Parallel { .. } | NodeKind::Conditional { .. }
            );
            if atomic && !in_loop && flow == Flow::Ok {
                if let Ok(mut completed) = self.completed.lock() {
                    completed.insert(id.to_string());
                }
            }
            if atomic {
                self.checkpoint();
            }
            flow
        }
        .boxed()
    }

    async fn sequence(&self, children: &[String], in_loop: bool) -> Flow {
        for child in children {
            match self.node(child, in_loop).await {
                Flow::Ok => {}
                other => return other,
            }
        }
        Flow::Ok
    }

    /// All children start together; the parent settles once every child has.
    async fn parallel(&self, children: &[String], in_loop: bool) -> Flow {
        let results = join_all(children.iter().map(|c| self.node(c, in_loop))).await;
        if results.iter().any(|f| *f == Flow::Cancelled) {
            return Flow::Cancelled;
        }
        results
            .into_iter()
            .find(|f| matches!(f, Flow::Failed { .. }))
            .unwrap_or(Flow::Ok)
    }

    async fn conditional(
        &self,
        node: &PlanNode,
        when_true: &[String],
        when_false: &[String],
        in_loop: bool,
    ) -> Flow {
        let Some(expr) = self.plan.expressions.get(&node.id) else {
            return Flow::failed(&node.id, "expression was not compiled");
        };
        let branch = expr.is_true(&self.snapshot());
        debug!(execution_id = %self.execution_id, node_id = %node.id, branch, "Conditional evaluated");
        self.sequence(if branch { when_true } else { when_false }, in_loop)
            .await
    }

    async fn repeat(&self, node: &PlanNode, body: &[String], mode: LoopMode, max: u32) -> Flow {
        let Some(expr) = self.plan.expressions.get(&node.id) else {
            return Flow::failed(&node.id, "loop expression was not compiled");
        };
        let index_key = format!("{}.index", node.id);
        let item_key = format!("{}.item", node.id);

        match mode {
            LoopMode::While => {
                let mut index: u32 = 0;
                loop {
                    if self.cancel.is_cancelled() {
                        return Flow::Cancelled;
                    }
                    if !expr.is_true(&self.snapshot()) {
                        return Flow::Ok;
                    }
                    if index >= max {
                        return Flow::failed(
                            &node.id,
                            format!("loop exceeded maxIterations ({})", max),
                        );
                    }
                    self.set_state(&index_key, Value::from(index));
                    match self.sequence(body, true).await {
                        Flow::Ok => index += 1,
                        other => return other,
                    }
                }
            }
            LoopMode::ForEach => {
                let items = match expr.evaluate(&self.snapshot()) {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Flow::failed(
                            &node.id,
                            format!("for-each collection is not an array: {}", other),
                        )
                    }
                };
                if items.len() > max as usize {
                    return Flow::failed(
                        &node.id,
                        format!(
                            "collection has {} items, exceeding maxIterations ({})",
                            items.len(),
                            max
                        ),
                    );
                }
                for (index, item) in items.into_iter().enumerate() {
                    if self.cancel.is_cancelled() {
                        return Flow::Cancelled;
                    }
                    self.set_state(&index_key, Value::from(index));
                    self.set_state(&item_key, item);
                    match self.sequence(body, true).await {
                        Flow::Ok => {}
                        other => return other,
                    }
                }
                Flow::Ok
            }
        }
    }

    /// Register a pending approval and suspend this branch until it is decided.
    async fn await_approval(&self, node: &PlanNode, timeout_secs: Option<u64>) -> Flow {
        let payload = match &node.kind {
            NodeKind::HumanApproval { prompt, payload } => match (prompt, payload) {
                (None, None) => None,
                (prompt, payload) => Some(serde_json::json!({
                    "prompt": prompt,
                    "payload": payload,
                })),
            },
            _ => None,
        };
        let entry = PendingApprovalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            plan_id: self.plan.plan.id.clone(),
            plan_version: self.plan.plan.version.clone(),
            node_id: node.id.clone(),
            node_type: node.type_name().to_string(),
            risk_level: node.risk_level,
            requires_approval: node.requires_approval,
            requested_at: Utc::now(),
            requested_by: "flowgate".to_string(),
            execution_id: Some(self.execution_id.clone()),
            payload,
        };
        let approval_id = entry.id.clone();

        let rx = match self.exec.broker.request(entry).await {
            Ok(rx) => rx,
            Err(e) => return Flow::failed(&node.id, format!("could not request approval: {}", e)),
        };
        self.log(LogLevel::Info, &node.id, format!("Awaiting approval {}", approval_id));

        let wait = async {
            match timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), rx).await.ok(),
                None => Some(rx.await),
            }
        };

        let decided = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let decision = ApprovalDecision::rejected(CANCEL_DECIDER, "execution cancelled");
                let _ = self.exec.broker.decide(&approval_id, decision).await;
                return Flow::Cancelled;
            }
            waited = wait => waited,
        };

        let completed = match decided {
            Some(Ok(completed)) => completed,
            Some(Err(_)) => return Flow::failed(&node.id, "approval waiter dropped"),
            None => {
                let secs = timeout_secs.unwrap_or_default();
                warn!(execution_id = %self.execution_id, node_id = %node.id, secs, "Approval timed out, rejecting");
                let decision = ApprovalDecision::rejected(
                    TIMEOUT_DECIDER,
                    format!("no decision within {}s", secs),
                );
                match self.exec.broker.decide(&approval_id, decision).await {
                    Ok(completed) => completed,
                    // A human decided in the same instant; honour that.
                    Err(FlowgateError::ApprovalAlreadyDecided(_)) => {
                        match self.exec.broker.find_decision(&approval_id) {
                            Ok(Some(completed)) => completed,
                            _ => {
                                return Flow::failed(
                                    &node.id,
                                    FlowgateError::ApprovalTimeout { node: node.id.clone() }
                                        .to_string(),
                                )
                            }
                        }
                    }
                    Err(e) => return Flow::failed(&node.id, e.to_string()),
                }
            }
        };

        match completed.status {
            ApprovalStatus::Approved => {
                self.node_event(node, NodeStatus::Success, 1, None);
                Flow::Ok
            }
            ApprovalStatus::Rejected => {
                let reason = completed.comment.unwrap_or_else(|| "rejected".to_string());
                let err = if completed.decided_by == TIMEOUT_DECIDER {
                    FlowgateError::ApprovalTimeout { node: node.id.clone() }
                } else {
                    FlowgateError::ApprovalRejected {
                        node: node.id.clone(),
                        reason,
                    }
                };
                self.node_event(node, NodeStatus::Failed, 1, Some(err.to_string()));
                Flow::failed(&node.id, err.to_string())
            }
        }
    }

    /// Approval gate (if any), then dispatch with retry.
    async fn action(&self, node: &PlanNode) -> Flow {
        let Some(adapter) = self.exec.registry.get(node.type_name()) else {
            let err = FlowgateError::AdapterNotFound(node.type_name().to_string()).to_string();
            self.node_event(node, NodeStatus::Failed, 1, Some(err.clone()));
            return Flow::failed(&node.id, err);
        };

        if self.exec.needs_approval(node) {
            match self
                .await_approval(node, self.exec.options.approvals.default_timeout_secs)
                .await
            {
                Flow::Ok => {}
                other => return other,
            }
        }

        let (max_attempts, backoff) = match &node.retry_policy {
            Some(p) => match Duration::try_from_secs_f64(p.backoff_seconds) {
                Ok(backoff) => (p.max_attempts.max(1), backoff),
                Err(e) => {
                    let err = format!("invalid retryPolicy.backoffSeconds {}: {}", p.backoff_seconds, e);
                    self.node_event(node, NodeStatus::Failed, 1, Some(err.clone()));
                    return Flow::failed(&node.id, err);
                }
            },
            None => (1, Duration::ZERO),
        };

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return Flow::Cancelled;
            }
            self.node_event(node, NodeStatus::Running, attempt, None);

            match self.attempt(adapter.as_ref(), node, attempt).await {
                Attempt::Success(output) => {
                    self.set_state(&format!("{}.output", node.id), output.unwrap_or(Value::Null));
                    self.node_event(node, NodeStatus::Success, attempt, None);
                    return Flow::Ok;
                }
                Attempt::Cancelled => {
                    self.node_event(node, NodeStatus::Cancelled, attempt, None);
                    return Flow::Cancelled;
                }
                Attempt::Failed(error) => {
                    warn!(
                        execution_id = %self.execution_id,
                        node_id = %node.id,
                        attempt,
                        max_attempts,
                        error = %error,
                        "Node attempt failed"
                    );
                    self.node_event(node, NodeStatus::Failed, attempt, Some(error.clone()));
                    last_error = error;
                }
            }

            if attempt < max_attempts && !backoff.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Flow::Cancelled,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        if max_attempts > 1 {
            last_error = format!("{} (after {} attempts)", last_error, max_attempts);
        }
        Flow::failed(&node.id, last_error)
    }

    async fn attempt(&self, adapter: &dyn NodeAdapter, node: &PlanNode, attempt: u32) -> Attempt {
        let ctx = NodeContext {
            execution_id: self.execution_id.clone(),
            plan_id: self.plan.plan.id.clone(),
            plan_version: self.plan.plan.version.clone(),
            state: self.snapshot(),
            attempt,
            cancel: self.cancel.child_token(),
        };

        let call = adapter.execute(node, ctx);
        let bounded = async {
            match node.timeout_seconds {
                Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), call).await {
                    Ok(result) => result,
                    Err(_) => Err(FlowgateError::NodeTimeout {
                        node: node.id.clone(),
                        timeout_secs: secs,
                    }),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Attempt::Cancelled,
            result = bounded => match result {
                Ok(outcome) => match outcome.status {
                    NodeStatus::Success | NodeStatus::Skipped => Attempt::Success(outcome.output),
                    NodeStatus::Cancelled => Attempt::Cancelled,
                    NodeStatus::Failed | NodeStatus::Running => Attempt::Failed(
                        outcome.error.unwrap_or_else(|| "adapter reported failure".to_string()),
                    ),
                },
                Err(FlowgateError::Cancelled) => Attempt::Cancelled,
                Err(e) => Attempt::Failed(e.to_string()),
            },
        }
    }

    fn snapshot(&self) -> StateMap {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn set_state(&self, key: &str, value: Value) {
        if let Ok(mut state) = self.state.lock() {
            state.insert(key.to_string(), value);
        }
    }

    fn set_last(&self, id: &str) {
        if let Ok(mut last) = self.last_node.lock() {
            *last = Some(id.to_string());
        }
    }

    fn is_completed(&self, id: &str) -> bool {
        self.completed
            .lock()
            .map(|c| c.contains(id))
            .unwrap_or(false)
    }

    /// Node outputs keyed by `<nodeId>.output`.
    fn outputs(&self) -> BTreeMap<String, Value> {
        self.snapshot()
            .into_iter()
            .filter(|(k, _)| k.ends_with(".output"))
            .collect()
    }

    fn checkpoint(&self) {
        if !self.exec.options.checkpoint {
            return;
        }
        let Some(store) = &self.exec.checkpoints else {
            return;
        };
        let state_json = match serde_json::to_string(&self.snapshot()) {
            Ok(json) => json,
            Err(e) => {
                warn!(execution_id = %self.execution_id, error = %e, "Failed to serialize checkpoint state");
                return;
            }
        };
        let mut completed_nodes: Vec<String> = self
            .completed
            .lock()
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        completed_nodes.sort();

        let cp = Checkpoint {
            execution_id: self.execution_id.clone(),
            plan_id: self.plan.plan.id.clone(),
            last_node_id: self.last_node.lock().ok().and_then(|l| l.clone()),
            completed_nodes,
            state_json,
            timestamp: Utc::now(),
        };
        if let Err(e) = store.save(&cp) {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to save checkpoint");
        }
    }

    fn node_event(&self, node: &PlanNode, status: NodeStatus, attempt: u32, error: Option<String>) {
        let message = match &error {
            Some(e) => format!("{} {} (attempt {}): {}", node.id, status, attempt, e),
            None => format!("{} {} (attempt {})", node.id, status, attempt),
        };
        let level = match status {
            NodeStatus::Failed => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        self.exec.event_bus.emit(
            "execution:node",
            &NodeEventPayload {
                execution_id: self.execution_id.clone(),
                node_id: node.id.clone(),
                node_type: node.type_name().to_string(),
                status,
                attempt,
                error,
            },
        );
        self.log(level, &node.id, message);
    }

    fn log(&self, level: LogLevel, node_id: &str, message: String) {
        self.exec.event_bus.emit(
            "log:line",
            &LogLinePayload {
                level,
                message,
                execution_id: Some(self.execution_id.clone()),
                node_id: Some(node_id.to_string()),
            },
        );
    }
}

fn approval_timeout(node: &PlanNode, options: &ExecutorOptions) -> Option<u64> {
    node.timeout_seconds
        .or(options.approvals.default_timeout_secs)
}
