//! Resume tokens for paused iteration runs (`.conductor/state/resume/<token>.json`).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::new_id;
use crate::io::config::write_atomic;

/// Everything needed to pick a paused run back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub token: String,
    pub task: String,
    pub branch: Option<String>,
    pub correlation_id: String,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
}

impl ResumeRecord {
    /// New record with a fresh token.
    pub fn new(
        task: impl Into<String>,
        branch: Option<String>,
        correlation_id: impl Into<String>,
        model_used: impl Into<String>,
    ) -> Self {
        Self {
            token: new_id(),
            task: task.into(),
            branch,
            correlation_id: correlation_id.into(),
            model_used: model_used.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `None` for tokens that could escape the store directory.
    fn record_path(&self, token: &str) -> Option<PathBuf> {
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{token}.json")))
    }

    pub fn save(&self, record: &ResumeRecord) -> Result<()> {
        let path = self
            .record_path(&record.token)
            .with_context(|| format!("invalid resume token '{}'", record.token))?;
        debug!(token = %record.token, path = %path.display(), "writing resume record");
        let mut buf = serde_json::to_string_pretty(record).context("serialize resume record")?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }

    /// Load and consume the record for `token`.
    ///
    /// Unknown or malformed tokens return `Ok(None)`; a token resumes at most once.
    pub fn take(&self, token: &str) -> Result<Option<ResumeRecord>> {
        let Some(path) = self.record_path(token) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read resume record {}", path.display()))?;
        let record: ResumeRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse resume record {}", path.display()))?;
        fs::remove_file(&path)
            .with_context(|| format!("remove resume record {}", path.display()))?;
        debug!(token, "resume record consumed");
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_record_is_taken_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::new(temp.path().join("resume"));
        let record = ResumeRecord::new("write prd", Some("main".to_string()), "cid", "ollama");

        store.save(&record).expect("save");
        assert_eq!(store.take(&record.token).expect("take"), Some(record.clone()));
        assert_eq!(store.take(&record.token).expect("take again"), None);
    }

    #[test]
    fn path_like_tokens_are_unknown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::new(temp.path());
        assert_eq!(store.take("../secret").expect("take"), None);
        assert_eq!(store.take("").expect("take"), None);
    }
}
