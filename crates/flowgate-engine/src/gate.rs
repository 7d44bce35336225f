use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::EventBus;
use flowgate_core::plan::PlanContext;
use flowgate_core::types::{
    ConcurrencyPolicy, ExecutionRecord, ExecutionStatus, RuntimeStatePayload,
};
use flowgate_store::{Checkpoint, ExecutionStore};

use crate::executor::Executor;

#[derive(Debug, Clone)]
pub struct GateOptions {
    /// Global cap on simultaneously running executions.
    pub max_running: usize,
    /// Policy for plans without `schedule.concurrency`.
    pub default_policy: ConcurrencyPolicy,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            max_running: 4,
            default_policy: ConcurrencyPolicy::Allow,
        }
    }
}

struct Queued {
    id: String,
    plan: Arc<PlanContext>,
    inputs: Value,
    policy: ConcurrencyPolicy,
    resume: Option<Checkpoint>,
}

struct Running {
    plan_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct GateState {
    records: HashMap<String, ExecutionRecord>,
    running: HashMap<String, Running>,
    /// Single FIFO of admitted-but-not-started executions.
    waiting: VecDeque<Queued>,
}

impl GateState {
    fn plan_busy(&self, plan_id: &str) -> bool {
        self.running.values().any(|r| r.plan_id == plan_id)
            || self.waiting.iter().any(|q| q.plan.plan.id == plan_id)
    }

    fn plan_running(&self, plan_id: &str) -> bool {
        self.running.values().any(|r| r.plan_id == plan_id)
    }

    /// Existing active record for `plan_id`, preferring a running one.
    fn active_for(&self, plan_id: &str) -> Option<ExecutionRecord> {
        let running = self
            .running
            .iter()
            .find(|(_, r)| r.plan_id == plan_id)
            .map(|(id, _)| id.clone());
        let waiting = || {
            self.waiting
                .iter()
                .find(|q| q.plan.plan.id == plan_id)
                .map(|q| q.id.clone())
        };
        running
            .or_else(waiting)
            .and_then(|id| self.records.get(&id).cloned())
    }
}

struct Inner {
    executor: Arc<Executor>,
    store: Option<Arc<ExecutionStore>>,
    event_bus: Arc<EventBus>,
    options: GateOptions,
    state: Mutex<GateState>,
    /// Bumped every time an execution reaches a terminal status.
    settled: watch::Sender<u64>,
}

/// Decides whether a request runs now, waits, or returns an existing run.
///
/// Plan-level policy (`allow` / `forbid` / `queue`) and the global cap
/// compose: a request must satisfy both before it starts. Requests that
/// cannot start are admitted as `pending` and promoted in FIFO order.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

impl ExecutionManager {
    pub fn new(
        executor: Arc<Executor>,
        store: Option<Arc<ExecutionStore>>,
        event_bus: Arc<EventBus>,
        options: GateOptions,
    ) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                executor,
                store,
                event_bus,
                options,
                state: Mutex::new(GateState::default()),
                settled,
            }),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.inner.executor
    }

    /// Request a new execution of `plan`.
    ///
    /// Under `forbid`, a plan that already has an active execution gets that
    /// record back unchanged.
    pub fn submit(&self, plan: Arc<PlanContext>, inputs: Value) -> Result<ExecutionRecord> {
        let record = ExecutionRecord::new(plan.plan.id.clone());
        self.inner.admit(plan, inputs, record, None)
    }

    /// Re-run an execution from its last checkpoint.
    pub fn resume(&self, execution_id: &str, plan: Arc<PlanContext>) -> Result<ExecutionRecord> {
        let checkpoints = self
            .inner
            .executor
            .checkpoints()
            .ok_or_else(|| FlowgateError::Storage("checkpointing is disabled".into()))?;
        let checkpoint = checkpoints
            .load(execution_id)?
            .ok_or_else(|| FlowgateError::ExecutionNotFound(execution_id.to_string()))?;
        if checkpoint.plan_id != plan.plan.id {
            return Err(FlowgateError::Storage(format!(
                "checkpoint for {} belongs to plan {}, not {}",
                execution_id, checkpoint.plan_id, plan.plan.id
            )));
        }
        if self.inner.lock()?.running.contains_key(execution_id) {
            return Err(FlowgateError::Storage(format!(
                "execution {} is still running",
                execution_id
            )));
        }

        let mut record = self
            .get(execution_id)?
            .unwrap_or_else(|| ExecutionRecord::new(plan.plan.id.clone()));
        record.id = execution_id.to_string();
        record.status = ExecutionStatus::Pending;
        record.finished_at = None;
        record.error = None;
        record.last_node_id = checkpoint.last_node_id.clone();

        info!(execution_id, plan_id = %plan.plan.id, "Resume requested");
        self.inner
            .admit(plan, Value::Null, record, Some(checkpoint))
    }

    /// Stop an execution. Running ones are cancelled cooperatively; pending
    /// ones are removed from the queue immediately.
    pub fn cancel(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let mut state = self.inner.lock()?;

        if let Some(running) = state.running.get(execution_id) {
            info!(execution_id, "Cancelling running execution");
            running.cancel.cancel();
            return state
                .records
                .get(execution_id)
                .cloned()
                .ok_or_else(|| FlowgateError::ExecutionNotFound(execution_id.to_string()));
        }

        if let Some(pos) = state.waiting.iter().position(|q| q.id == execution_id) {
            state.waiting.remove(pos);
            let record = match state.records.get_mut(execution_id) {
                Some(record) => {
                    record.finish(ExecutionStatus::Cancelled, None);
                    record.clone()
                }
                None => return Err(FlowgateError::ExecutionNotFound(execution_id.to_string())),
            };
            info!(execution_id, "Cancelled pending execution");
            let persisted = self.inner.persist(&record);
            Inner::settle_record(&mut state, record.clone(), persisted);
            self.inner.event_bus.emit("execution:cancelled", &record);
            self.inner.settled.send_modify(|n| *n += 1);
            // A removed waiter may unblock a queued run of the same plan.
            self.inner.promote(&mut state);
            return Ok(record);
        }

        drop(state);
        self.get(execution_id)?
            .ok_or_else(|| FlowgateError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Cancel every running and pending execution.
    pub fn cancel_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let state = self.inner.lock()?;
            state
                .running
                .keys()
                .cloned()
                .chain(state.waiting.iter().map(|q| q.id.clone()))
                .collect()
        };
        for id in ids {
            self.cancel(&id)?;
        }
        Ok(())
    }

    pub fn get(&self, execution_id: &str) -> Result<Option<ExecutionRecord>> {
        if let Some(record) = self.inner.lock()?.records.get(execution_id) {
            return Ok(Some(record.clone()));
        }
        match &self.inner.store {
            Some(store) => store.load(execution_id),
            None => Ok(None),
        }
    }

    /// Persisted and in-memory records, oldest first.
    pub fn list(&self) -> Result<Vec<ExecutionRecord>> {
        let mut by_id: HashMap<String, ExecutionRecord> = match &self.inner.store {
            Some(store) => store.list()?.into_iter().map(|r| (r.id.clone(), r)).collect(),
            None => HashMap::new(),
        };
        for (id, record) in &self.inner.lock()?.records {
            by_id.insert(id.clone(), record.clone());
        }
        let mut records: Vec<ExecutionRecord> = by_id.into_values().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    pub fn runtime_state(&self) -> RuntimeStatePayload {
        match self.inner.lock() {
            Ok(state) => RuntimeStatePayload {
                running: state.running.len(),
                pending: state.waiting.len(),
                dropped_messages: 0,
            },
            Err(_) => RuntimeStatePayload {
                running: 0,
                pending: 0,
                dropped_messages: 0,
            },
        }
    }

    /// Wait until `execution_id` reaches a terminal status.
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let mut rx = self.inner.settled.subscribe();
        loop {
            let record = self
                .get(execution_id)?
                .ok_or_else(|| FlowgateError::ExecutionNotFound(execution_id.to_string()))?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if rx.changed().await.is_err() {
                return Err(FlowgateError::Storage("execution manager dropped".into()));
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, GateState>> {
        self.state
            .lock()
            .map_err(|e| FlowgateError::Storage(format!("execution gate poisoned: {}", e)))
    }

    /// Save `record`; true when the store now holds it.
    fn persist(&self, record: &ExecutionRecord) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.save(record) {
            Ok(()) => true,
            Err(e) => {
                warn!(execution_id = %record.id, error = %e, "Failed to persist execution record");
                false
            }
        }
    }

    /// Drop a terminal record from memory once the store has it; later
    /// lookups read it back from disk.
    fn settle_record(state: &mut GateState, record: ExecutionRecord, persisted: bool) {
        if persisted {
            state.records.remove(&record.id);
        } else {
            state.records.insert(record.id.clone(), record);
        }
    }

    fn admit(
        self: &Arc<Self>,
        plan: Arc<PlanContext>,
        inputs: Value,
        mut record: ExecutionRecord,
        resume: Option<Checkpoint>,
    ) -> Result<ExecutionRecord> {
        let policy = plan
            .plan
            .schedule
            .concurrency
            .unwrap_or(self.options.default_policy);
        let plan_id = plan.plan.id.clone();
        let mut state = self.lock()?;

        if policy == ConcurrencyPolicy::Forbid {
            if let Some(existing) = state.active_for(&plan_id) {
                debug!(plan_id = %plan_id, execution_id = %existing.id, "Forbid policy: returning active execution");
                return Ok(existing);
            }
        }

        let blocked_by_plan = policy == ConcurrencyPolicy::Queue && state.plan_busy(&plan_id);
        let at_cap = state.running.len() >= self.options.max_running;
        // Earlier waiters keep their place in line.
        let line_ahead = !state.waiting.is_empty();

        state.records.insert(record.id.clone(), record.clone());
        let queued = Queued {
            id: record.id.clone(),
            plan,
            inputs,
            policy,
            resume,
        };

        if blocked_by_plan || at_cap || line_ahead {
            record.status = ExecutionStatus::Pending;
            info!(
                execution_id = %record.id,
                plan_id = %plan_id,
                blocked_by_plan,
                at_cap,
                "Execution queued"
            );
            state.waiting.push_back(queued);
            self.persist(&record);
            self.event_bus.emit("execution:queued", &record);
            // The line may be movable right now (e.g. capacity free but waiters present).
            self.promote(&mut state);
            return Ok(state.records.get(&record.id).cloned().unwrap_or(record));
        }

        Ok(self.start(&mut state, queued))
    }

    /// Start FIFO waiters that are now eligible.
    fn promote(self: &Arc<Self>, state: &mut GateState) {
        let mut i = 0;
        while i < state.waiting.len() {
            if state.running.len() >= self.options.max_running {
                break;
            }
            let candidate = &state.waiting[i];
            let serialized = matches!(
                candidate.policy,
                ConcurrencyPolicy::Queue | ConcurrencyPolicy::Forbid
            );
            if serialized && state.plan_running(&candidate.plan.plan.id) {
                i += 1;
                continue;
            }
            if let Some(queued) = state.waiting.remove(i) {
                debug!(execution_id = %queued.id, "Promoting pending execution");
                self.start(state, queued);
            }
        }
    }

    fn start(self: &Arc<Self>, state: &mut GateState, queued: Queued) -> ExecutionRecord {
        let cancel = CancellationToken::new();
        let record = {
            let Some(record) = state.records.get_mut(&queued.id) else {
                warn!(execution_id = %queued.id, "Record vanished before start");
                return ExecutionRecord::new(queued.plan.plan.id.clone());
            };
            record.status = ExecutionStatus::Running;
            record.clone()
        };
        state.running.insert(
            queued.id.clone(),
            Running {
                plan_id: queued.plan.plan.id.clone(),
                cancel: cancel.clone(),
            },
        );

        info!(execution_id = %record.id, plan_id = %record.plan_id, "Execution running");
        self.persist(&record);
        self.event_bus.emit("execution:started", &record);

        let executor = Arc::clone(&self.executor);
        let to_run = record.clone();
        let run = tokio::spawn(async move {
            executor
                .execute(queued.plan, to_run, queued.inputs, cancel, queued.resume)
                .await
        });

        let inner = Arc::clone(self);
        let mut aborted = record.clone();
        tokio::spawn(async move {
            let finished = match run.await {
                Ok(finished) => finished,
                Err(e) => {
                    error!(execution_id = %aborted.id, error = %e, "Execution task aborted");
                    aborted.finish(
                        ExecutionStatus::Failed,
                        Some(format!("execution task aborted: {}", e)),
                    );
                    aborted
                }
            };
            inner.on_finished(finished);
        });
        record
    }

    fn on_finished(self: &Arc<Self>, record: ExecutionRecord) {
        let event = match record.status {
            ExecutionStatus::Success => "execution:completed",
            ExecutionStatus::Cancelled => "execution:cancelled",
            _ => "execution:failed",
        };
        let persisted = self.persist(&record);
        self.event_bus.emit(event, &record);

        match self.lock() {
            Ok(mut state) => {
                state.running.remove(&record.id);
                Self::settle_record(&mut state, record, persisted);
                self.promote(&mut state);
            }
            Err(e) => warn!(error = %e, "Could not release execution slot"),
        }
        self.settled.send_modify(|n| *n += 1);
    }
}
