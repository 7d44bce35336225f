use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::{ApprovalDecision, CompletedApprovalEntry, PendingApprovalEntry};

use crate::atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApprovalFile {
    #[serde(default)]
    pending: Vec<PendingApprovalEntry>,
    #[serde(default)]
    completed: Vec<CompletedApprovalEntry>,
}

/// Durable approval table: one JSON file holding pending and completed entries.
///
/// Every mutation rewrites the whole file atomically, so moving an entry from
/// pending to completed is a single durable step.
pub struct ApprovalStore {
    path: PathBuf,
    state: Mutex<ApprovalFile>,
}

impl ApprovalStore {
    /// Open the store, loading any existing file.
    pub fn open(path: &Path) -> Result<Self> {
        let state = atomic::read_json::<ApprovalFile>(path)?.unwrap_or_default();
        debug!(
            path = %path.display(),
            pending = state.pending.len(),
            completed = state.completed.len(),
            "Approval store opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ApprovalFile>> {
        self.state
            .lock()
            .map_err(|e| FlowgateError::Storage(format!("approval store poisoned: {}", e)))
    }

    pub fn append_pending(&self, entry: PendingApprovalEntry) -> Result<()> {
        let mut state = self.lock()?;
        if state.pending.iter().any(|p| p.id == entry.id)
            || state.completed.iter().any(|c| c.id() == entry.id)
        {
            return Err(FlowgateError::Storage(format!(
                "approval id already exists: {}",
                entry.id
            )));
        }
        state.pending.push(entry);
        atomic::write_json(&self.path, &*state)
    }

    /// Record a decision, moving the pending entry to completed.
    pub fn append_completed(
        &self,
        id: &str,
        decision: ApprovalDecision,
    ) -> Result<CompletedApprovalEntry> {
        let mut state = self.lock()?;
        let Some(pos) = state.pending.iter().position(|p| p.id == id) else {
            if state.completed.iter().any(|c| c.id() == id) {
                return Err(FlowgateError::ApprovalAlreadyDecided(id.to_string()));
            }
            return Err(FlowgateError::ApprovalNotFound(id.to_string()));
        };

        let request = state.pending.remove(pos);
        let completed = CompletedApprovalEntry::from_pending(request, decision);
        state.completed.push(completed.clone());

        if let Err(e) = atomic::write_json(&self.path, &*state) {
            // Keep memory consistent with disk.
            if let Some(done) = state.completed.pop() {
                state.pending.insert(pos, done.request);
            }
            return Err(e);
        }
        Ok(completed)
    }

    /// Pending entries, oldest request first.
    pub fn list_pending(&self) -> Result<Vec<PendingApprovalEntry>> {
        let state = self.lock()?;
        let mut pending = state.pending.clone();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(pending)
    }

    pub fn list_completed(&self) -> Result<Vec<CompletedApprovalEntry>> {
        Ok(self.lock()?.completed.clone())
    }

    pub fn find_pending(&self, id: &str) -> Result<Option<PendingApprovalEntry>> {
        Ok(self.lock()?.pending.iter().find(|p| p.id == id).cloned())
    }

    pub fn find_decision(&self, id: &str) -> Result<Option<CompletedApprovalEntry>> {
        Ok(self.lock()?.completed.iter().find(|c| c.id() == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use flowgate_core::types::{ApprovalStatus, RiskLevel};

    fn entry(id: &str, minutes_ago: i64) -> PendingApprovalEntry {
        PendingApprovalEntry {
            id: id.to_string(),
            plan_id: "deploy".into(),
            plan_version: "1".into(),
            node_id: format!("node-{}", id),
            node_type: "human_approval".into(),
            risk_level: RiskLevel::High,
            requires_approval: true,
            requested_at: Utc::now() - Duration::minutes(minutes_ago),
            requested_by: "engine".into(),
            execution_id: None,
            payload: None,
        }
    }

    #[test]
    fn decision_moves_entry_from_pending_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::open(&dir.path().join("approvals.json")).unwrap();

        store.append_pending(entry("a1", 0)).unwrap();
        assert_eq!(store.list_pending().unwrap().len(), 1);

        let decided = store
            .append_completed("a1", ApprovalDecision::rejected("alice", "not today"))
            .unwrap();
        assert_eq!(decided.id(), "a1");
        assert_eq!(decided.status, ApprovalStatus::Rejected);
        assert_eq!(decided.comment.as_deref(), Some("not today"));

        assert!(store.list_pending().unwrap().is_empty());
        assert!(store.find_pending("a1").unwrap().is_none());
        assert_eq!(store.list_completed().unwrap().len(), 1);
        assert_eq!(
            store.find_decision("a1").unwrap().unwrap().decided_by,
            "alice"
        );
    }

    #[test]
    fn decisions_are_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::open(&dir.path().join("approvals.json")).unwrap();
        store.append_pending(entry("a1", 0)).unwrap();
        store
            .append_completed("a1", ApprovalDecision::approved("bob"))
            .unwrap();

        let err = store
            .append_completed("a1", ApprovalDecision::rejected("bob", "changed my mind"))
            .unwrap_err();
        assert!(matches!(err, FlowgateError::ApprovalAlreadyDecided(_)));

        let err = store
            .append_completed("ghost", ApprovalDecision::approved("bob"))
            .unwrap_err();
        assert!(matches!(err, FlowgateError::ApprovalNotFound(_)));
    }

    #[test]
    fn pending_sorted_by_request_time_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.json");
        {
            let store = ApprovalStore::open(&path).unwrap();
            store.append_pending(entry("newest", 1)).unwrap();
            store.append_pending(entry("oldest", 30)).unwrap();
            store.append_pending(entry("middle", 10)).unwrap();
        }

        let reopened = ApprovalStore::open(&path).unwrap();
        let ids: Vec<String> = reopened
            .list_pending()
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["oldest", "middle", "newest"]);
    }
}
