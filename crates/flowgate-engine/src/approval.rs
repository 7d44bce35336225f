use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::info;

use flowgate_core::error::Result;
use flowgate_core::event::EventBus;
use flowgate_core::types::{ApprovalDecision, CompletedApprovalEntry, PendingApprovalEntry};
use flowgate_store::ApprovalStore;

/// Couples the durable approval store with in-memory waiters.
///
/// The waiter is registered before the pending entry becomes visible in the
/// store, so any decision recorded against that entry finds it. A decision
/// is written before the waiter is woken, so a restart never loses either
/// side.
pub struct ApprovalBroker {
    store: Arc<ApprovalStore>,
    waiters: Mutex<HashMap<String, oneshot::Sender<CompletedApprovalEntry>>>,
    event_bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(store: Arc<ApprovalStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
            event_bus,
        }
    }

    /// Persist a pending entry, publish it, and return a receiver for the decision.
    pub async fn request(
        &self,
        entry: PendingApprovalEntry,
    ) -> Result<oneshot::Receiver<CompletedApprovalEntry>> {
        let (tx, rx) = oneshot::channel();
        let id = entry.id.clone();

        self.waiters.lock().await.insert(id.clone(), tx);
        if let Err(e) = self.store.append_pending(entry.clone()) {
            self.waiters.lock().await.remove(&id);
            return Err(e);
        }

        info!(
            approval_id = %id,
            node_id = %entry.node_id,
            risk = %entry.risk_level,
            "Approval requested"
        );
        self.event_bus.emit("approval:requested", &entry);
        Ok(rx)
    }

    /// Record a decision (REST, CLI, or the engine's own timeout path).
    ///
    /// Fails with `ApprovalNotFound` / `ApprovalAlreadyDecided` without side effects.
    pub async fn decide(&self, id: &str, decision: ApprovalDecision) -> Result<CompletedApprovalEntry> {
        let completed = self.store.append_completed(id, decision)?;

        info!(
            approval_id = %id,
            status = ?completed.status,
            decided_by = %completed.decided_by,
            "Approval decided"
        );
        self.event_bus.emit("approval:decided", &completed);

        if let Some(tx) = self.waiters.lock().await.remove(id) {
            // Receiver may be gone if the waiting execution was cancelled.
            let _ = tx.send(completed.clone());
        }
        Ok(completed)
    }

    pub fn list_pending(&self) -> Result<Vec<PendingApprovalEntry>> {
        self.store.list_pending()
    }

    pub fn find_decision(&self, id: &str) -> Result<Option<CompletedApprovalEntry>> {
        self.store.find_decision(id)
    }

    /// Number of in-process waiters (pending entries loaded from disk have none).
    pub async fn waiting(&self) -> usize {
        self.waiters.lock().await.len()
    }
}
