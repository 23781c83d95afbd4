//! Shared backlog file (`.conductor/state/backlog.json`).
//!
//! Several workers may update the backlog at once, so every read-modify-write
//! cycle holds an exclusive OS lock on a sidecar `.lock` file.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::new_id;
use crate::io::config::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogStatus {
    Queued,
    Committed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub id: String,
    pub task_id: String,
    pub summary: String,
    pub status: BacklogStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Backlog {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Backlog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    /// Snapshot of all entries, oldest first.
    pub fn list(&self) -> Result<Vec<BacklogEntry>> {
        let _lock = self.lock()?;
        self.read_entries()
    }

    /// Append a queued entry for `task_id`.
    #[instrument(skip_all, fields(task_id))]
    pub fn push(&self, task_id: &str, summary: &str) -> Result<BacklogEntry> {
        let entry = BacklogEntry {
            id: new_id(),
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            status: BacklogStatus::Queued,
            created_at: Utc::now(),
            commit_hash: None,
        };
        self.update(|entries| entries.push(entry.clone()))?;
        Ok(entry)
    }

    /// Set the status of the newest entry for `task_id`, appending one if none exists.
    #[instrument(skip_all, fields(task_id, ?status))]
    pub fn record(
        &self,
        task_id: &str,
        summary: &str,
        status: BacklogStatus,
        commit_hash: Option<&str>,
    ) -> Result<BacklogEntry> {
        self.update(|entries| {
            let position = entries.iter().rposition(|e| e.task_id == task_id);
            let entry = match position {
                Some(idx) => &mut entries[idx],
                None => {
                    entries.push(BacklogEntry {
                        id: new_id(),
                        task_id: task_id.to_string(),
                        summary: summary.to_string(),
                        status,
                        created_at: Utc::now(),
                        commit_hash: None,
                    });
                    let last = entries.len() - 1;
                    &mut entries[last]
                }
            };
            entry.status = status;
            if let Some(hash) = commit_hash {
                entry.commit_hash = Some(hash.to_string());
            }
            entry.clone()
        })
    }

    fn update<T>(&self, mutate: impl FnOnce(&mut Vec<BacklogEntry>) -> T) -> Result<T> {
        let _lock = self.lock()?;
        let mut entries = self.read_entries()?;
        let result = mutate(&mut entries);
        let mut buf = serde_json::to_string_pretty(&entries).context("serialize backlog")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)?;
        debug!(entries = entries.len(), "backlog written");
        Ok(result)
    }

    fn read_entries(&self) -> Result<Vec<BacklogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read backlog {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("parse backlog {}", self.path.display()))
    }

    /// Exclusive lock held until the returned file is dropped.
    fn lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("open backlog lock {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", self.lock_path.display()))?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_list_preserves_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backlog = Backlog::new(temp.path().join("state/backlog.json"));
        backlog.push("t-1", "first").expect("push");
        backlog.push("t-2", "second").expect("push");

        let entries = backlog.list().expect("list");
        let ids: Vec<&str> = entries.iter().map(|e| e.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t-1", "t-2"]);
        assert!(entries.iter().all(|e| e.status == BacklogStatus::Queued));
    }

    #[test]
    fn record_updates_latest_entry_or_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backlog = Backlog::new(temp.path().join("backlog.json"));
        backlog.push("t-1", "first").expect("push");

        let updated = backlog
            .record("t-1", "first", BacklogStatus::Committed, Some("abc"))
            .expect("record");
        assert_eq!(updated.status, BacklogStatus::Committed);
        assert_eq!(updated.commit_hash.as_deref(), Some("abc"));

        backlog
            .record("t-9", "new", BacklogStatus::Failed, None)
            .expect("record");
        let entries = backlog.list().expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].task_id, "t-9");
    }

    #[test]
    fn concurrent_pushes_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backlog = Arc::new(Backlog::new(temp.path().join("backlog.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let backlog = Arc::clone(&backlog);
                thread::spawn(move || {
                    backlog
                        .push(&format!("t-{i}"), "parallel")
                        .expect("push");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(backlog.list().expect("list").len(), 8);
    }
}
