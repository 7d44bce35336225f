use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use flowgate_core::error::Result;
use flowgate_core::types::ExecutionRecord;

use crate::atomic;

/// One JSON file per execution record.
pub struct ExecutionStore {
    dir: PathBuf,
}

impl ExecutionStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn save(&self, record: &ExecutionRecord) -> Result<()> {
        atomic::write_json(&self.record_path(&record.id), record)
    }

    pub fn load(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        atomic::read_json(&self.record_path(id))
    }

    /// All records, oldest `startedAt` first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some("json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_record {
                continue;
            }
            match atomic::read_json::<ExecutionRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable execution record"),
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::types::ExecutionStatus;

    #[test]
    fn save_update_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionStore::open(dir.path()).unwrap();

        let mut first = ExecutionRecord::new("plan-a");
        store.save(&first).unwrap();
        let second = ExecutionRecord::new("plan-b");
        store.save(&second).unwrap();

        first.finish(ExecutionStatus::Success, None);
        store.save(&first).unwrap();

        let loaded = store.load(&first.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Success);
        assert!(loaded.finished_at.is_some());

        let all = store.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first.id);
        assert!(store.load("missing").unwrap().is_none());
    }
}
