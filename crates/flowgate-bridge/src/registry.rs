use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::types::BridgeSessionRecord;
use flowgate_store::atomic;

/// Durable `(serverName, userId) -> BridgeSessionRecord` map.
pub struct SessionRegistry {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<(String, String), BridgeSessionRecord>>,
}

impl SessionRegistry {
    /// Load from `path` (a JSON array), creating it lazily on first write.
    pub fn open(path: &Path) -> Result<Self> {
        let loaded: Vec<BridgeSessionRecord> = atomic::read_json(path)?.unwrap_or_default();
        let records = loaded
            .into_iter()
            .map(|r| ((r.server_name.clone(), r.user_id.clone()), r))
            .collect();
        Ok(Self {
            path: Some(path.to_path_buf()),
            records: Mutex::new(records),
        })
    }

    /// Registry that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, server_name: &str, user_id: &str) -> Option<BridgeSessionRecord> {
        self.records
            .lock()
            .ok()?
            .get(&(server_name.to_string(), user_id.to_string()))
            .cloned()
    }

    /// Record the session id for a fresh (or resumed) connection.
    ///
    /// `last_event_id` and `metadata` survive when the session id is unchanged.
    pub fn record_session(&self, server_name: &str, user_id: &str, session_id: &str) -> Result<BridgeSessionRecord> {
        self.update(server_name, user_id, |existing| match existing {
            Some(mut record) if record.session_id == session_id => {
                record.updated_at = Utc::now();
                record
            }
            _ => BridgeSessionRecord {
                server_name: server_name.to_string(),
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
                last_event_id: None,
                metadata: None,
                updated_at: Utc::now(),
            },
        })
    }

    /// Remember the last server event seen, so a resume skips it.
    pub fn record_event(&self, server_name: &str, user_id: &str, event_id: &str) -> Result<()> {
        let Some(mut record) = self.get(server_name, user_id) else {
            return Ok(());
        };
        record.last_event_id = Some(event_id.to_string());
        record.updated_at = Utc::now();
        self.update(server_name, user_id, |_| record)?;
        Ok(())
    }

    pub fn remove(&self, server_name: &str, user_id: &str) -> Result<Option<BridgeSessionRecord>> {
        let mut records = self.lock()?;
        let removed = records.remove(&(server_name.to_string(), user_id.to_string()));
        self.persist(&records)?;
        Ok(removed)
    }

    pub fn list(&self) -> Vec<BridgeSessionRecord> {
        self.records
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    fn update(
        &self,
        server_name: &str,
        user_id: &str,
        f: impl FnOnce(Option<BridgeSessionRecord>) -> BridgeSessionRecord,
    ) -> Result<BridgeSessionRecord> {
        let mut records = self.lock()?;
        let key = (server_name.to_string(), user_id.to_string());
        let record = f(records.get(&key).cloned());
        records.insert(key, record.clone());
        // Written under the lock so concurrent updates land in order.
        self.persist(&records)?;
        drop(records);
        debug!(server = %server_name, user = %user_id, session_id = %record.session_id, "Bridge session recorded");
        Ok(record)
    }

    fn persist(&self, records: &BTreeMap<(String, String), BridgeSessionRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot: Vec<&BridgeSessionRecord> = records.values().collect();
        atomic::write_json(path, &snapshot)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), BridgeSessionRecord>>> {
        self.records
            .lock()
            .map_err(|e| FlowgateError::Storage(format!("session registry poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen_and_keeps_event_id_for_same_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-sessions.json");

        let registry = SessionRegistry::open(&path).unwrap();
        registry.record_session("search", "alice", "s-1").unwrap();
        registry.record_event("search", "alice", "evt-7").unwrap();
        drop(registry);

        let registry = SessionRegistry::open(&path).unwrap();
        let record = registry.get("search", "alice").unwrap();
        assert_eq!(record.session_id, "s-1");
        assert_eq!(record.last_event_id.as_deref(), Some("evt-7"));

        registry.record_session("search", "alice", "s-1").unwrap();
        assert_eq!(
            registry.get("search", "alice").unwrap().last_event_id.as_deref(),
            Some("evt-7")
        );

        registry.record_session("search", "alice", "s-2").unwrap();
        assert!(registry.get("search", "alice").unwrap().last_event_id.is_none());
    }

    #[test]
    fn keyed_by_server_and_user() {
        let registry = SessionRegistry::in_memory();
        registry.record_session("search", "alice", "a").unwrap();
        registry.record_session("search", "bob", "b").unwrap();
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("search", "bob").unwrap().session_id, "b");
        assert!(registry.get("other", "alice").is_none());

        registry.remove("search", "alice").unwrap();
        assert!(registry.get("search", "alice").is_none());
    }

    #[test]
    fn event_for_unknown_session_is_ignored() {
        let registry = SessionRegistry::in_memory();
        registry.record_event("search", "nobody", "evt-1").unwrap();
        assert!(registry.list().is_empty());
    }
}
