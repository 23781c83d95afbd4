//! Idempotent "commit the artifact" workflow.
//!
//! A commit carrying `Idempotency-UUID: <uuid>` in its message is the only
//! record that an attempt already happened, so retries across processes and
//! workers never produce a second commit. The caller's uncommitted work is
//! stashed around the commit and restored on every exit path by
//! [`StashGuard`], including early returns and panics.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::types::id_or_new;
use crate::core::violations::{require_identifier, require_relative_path};
use crate::io::config::{HandshakeConfig, Toggles};
use crate::io::git::{Git, IDEMPOTENCY_TRAILER, StashEntry, StashPop};
use crate::io::test_runner::{TestRequest, TestRunner};

/// Trailer tying the commit to the run that produced it.
pub const CORRELATION_TRAILER: &str = "Correlation-Id";
/// Namespace for stashes preserved after a failed restore.
pub const PRESERVED_STASH_REF: &str = "refs/conductor-stash";

#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub artifact: String,
    pub task_summary: String,
    pub task_id: String,
    /// Branch to push to.
    pub branch: String,
    pub correlation_id: Option<String>,
    pub idempotency_uuid: Option<String>,
    /// Repo-relative target; defaults to `<artifact_dir>/<task_id>.md`.
    pub artifact_path: Option<PathBuf>,
    /// Skip the push (also enabled by `DRY_RUN`).
    pub dry_run: bool,
}

impl HandshakeRequest {
    pub fn new(
        artifact: impl Into<String>,
        task_summary: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            artifact: artifact.into(),
            task_summary: task_summary.into(),
            task_id: task_id.into(),
            branch: "main".to_string(),
            correlation_id: None,
            idempotency_uuid: None,
            artifact_path: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeFailure {
    DirtyWorkspace,
    GitAddFailed,
    GitCommitFailed,
    TestsFailed,
    PushFailed,
    StashApplyConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeOutcome {
    Committed {
        commit_hash: String,
        idempotency_uuid: String,
        correlation_id: String,
        pushed: bool,
        elapsed_ms: u64,
    },
    Skipped {
        reason: SkipReason,
        commit_hash: String,
        idempotency_uuid: String,
    },
    Error {
        reason: HandshakeFailure,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
        idempotency_uuid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl HandshakeOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::Skipped { .. } => "skipped",
            Self::Error { .. } => "error",
        }
    }

    pub fn commit_hash(&self) -> Option<&str> {
        match self {
            Self::Committed { commit_hash, .. } | Self::Skipped { commit_hash, .. } => {
                Some(commit_hash)
            }
            Self::Error { commit_hash, .. } => commit_hash.as_deref(),
        }
    }
}

pub struct QueueHandshake<T> {
    git: Git,
    config: HandshakeConfig,
    toggles: Toggles,
    tests: T,
}

impl<T: TestRunner> QueueHandshake<T> {
    pub fn new(git: Git, config: HandshakeConfig, tests: T) -> Self {
        Self {
            git,
            config,
            toggles: Toggles::default(),
            tests,
        }
    }

    pub fn with_toggles(mut self, toggles: Toggles) -> Self {
        self.toggles = toggles;
        self
    }

    fn remote(&self) -> &str {
        self.toggles
            .git_remote
            .as_deref()
            .unwrap_or(&self.config.remote)
    }

    /// Commit `request.artifact` exactly once per idempotency uuid.
    ///
    /// Guardrail violations (blank task id, escaping path) are returned as
    /// `Err`; every operational failure is an [`HandshakeOutcome::Error`].
    #[instrument(skip_all, fields(task_id = %request.task_id))]
    pub fn queue_handshake(&self, request: &HandshakeRequest) -> Result<HandshakeOutcome> {
        let started = Instant::now();
        require_identifier("task_id", &request.task_id)?;
        require_identifier("branch", &request.branch)?;
        let artifact_path = match &request.artifact_path {
            Some(path) => path.clone(),
            None => self
                .config
                .artifact_dir
                .join(format!("{}.md", request.task_id.trim())),
        };
        require_relative_path(&artifact_path)?;

        let uuid = id_or_new(request.idempotency_uuid.as_deref());
        let correlation_id = id_or_new(request.correlation_id.as_deref());
        let fail = |reason, commit_hash: Option<String>, detail: Option<String>| {
            HandshakeOutcome::Error {
                reason,
                commit_hash,
                idempotency_uuid: uuid.clone(),
                detail,
            }
        };

        if let Some(existing) = self
            .git
            .commits_with_idempotency_uuid(&uuid)?
            .into_iter()
            .next()
        {
            info!(uuid = %uuid, commit = %existing, "duplicate handshake skipped");
            return Ok(HandshakeOutcome::Skipped {
                reason: SkipReason::Duplicate,
                commit_hash: existing,
                idempotency_uuid: uuid,
            });
        }

        let mut stash = StashGuard::new(&self.git, &uuid);
        if !self.stash_until_clean(&mut stash, &correlation_id)? {
            stash.restore()?;
            return Ok(fail(HandshakeFailure::DirtyWorkspace, None, None));
        }

        let target = self.git.workdir().join(&artifact_path);
        let staged = write_artifact(&target, &request.artifact)
            .and_then(|()| self.git.add_path(&artifact_path));
        if let Err(err) = staged {
            warn!(error = %err, "staging artifact failed");
            stash.restore()?;
            return Ok(fail(HandshakeFailure::GitAddFailed, None, Some(format!("{err:#}"))));
        }

        let subject = format!("{}: {}", request.task_id.trim(), request.task_summary.trim());
        let body = format!(
            "{CORRELATION_TRAILER}: {correlation_id}\n{IDEMPOTENCY_TRAILER}: {uuid}"
        );
        let commit_hash = match self.git.commit(&subject, &body) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(error = %err, "commit failed");
                stash.restore()?;
                return Ok(fail(
                    HandshakeFailure::GitCommitFailed,
                    None,
                    Some(format!("{err:#}")),
                ));
            }
        };
        info!(commit = %commit_hash, uuid = %uuid, "artifact committed");

        let test_request = TestRequest {
            workdir: self.git.workdir().to_path_buf(),
            timeout: Duration::from_secs(self.config.test_timeout_secs),
            output_limit_bytes: self.config.test_output_limit_bytes,
        };
        let red = match self.tests.run(&test_request) {
            Ok(outcome) if outcome.green() => None,
            Ok(outcome) => Some(format!("test suite exited {:?}", outcome.exit_code)),
            Err(err) => Some(format!("{err:#}")),
        };
        if let Some(detail) = red {
            warn!(commit = %commit_hash, %detail, "tests red; keeping commit unpushed");
            stash.restore()?;
            return Ok(fail(
                HandshakeFailure::TestsFailed,
                Some(commit_hash),
                Some(detail),
            ));
        }

        let dry_run = request.dry_run || self.toggles.dry_run;
        if dry_run {
            info!(commit = %commit_hash, "dry run; push skipped");
        } else if let Err(err) = self.git.push_head(self.remote(), &request.branch) {
            warn!(error = %err, remote = self.remote(), "push failed");
            stash.restore()?;
            return Ok(fail(
                HandshakeFailure::PushFailed,
                Some(commit_hash),
                Some(format!("{err:#}")),
            ));
        }

        if let Restore::Conflict { preserved_ref } = stash.restore()? {
            return Ok(fail(
                HandshakeFailure::StashApplyConflict,
                Some(commit_hash),
                Some(format!("local changes preserved at {preserved_ref}")),
            ));
        }

        drop(stash);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(commit = %commit_hash, elapsed_ms, "handshake committed");
        Ok(HandshakeOutcome::Committed {
            commit_hash,
            idempotency_uuid: uuid,
            correlation_id,
            pushed: !dry_run,
            elapsed_ms,
        })
    }

    /// Stash until the tree is clean. Returns `false` if it never got clean.
    fn stash_until_clean(&self, stash: &mut StashGuard<'_>, correlation_id: &str) -> Result<bool> {
        for attempt in 1..=self.config.stash_attempts {
            if self.git.is_clean()? {
                return Ok(true);
            }
            let message = format!("conductor handshake {correlation_id} attempt {attempt}");
            if let Some(entry) = self.git.stash_push(&message)? {
                debug!(attempt, sha = %entry.sha, "stashed local changes");
                stash.track(entry);
            }
        }
        self.git.is_clean()
    }
}

fn write_artifact(target: &std::path::Path, contents: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(target, contents).with_context(|| format!("write artifact {}", target.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Restore {
    Applied,
    Conflict { preserved_ref: String },
}

/// Stashes created during one handshake, restored newest first.
///
/// Whatever is still held when the guard drops is restored then, so no exit
/// path can leave the caller's changes in the stash list.
struct StashGuard<'a> {
    git: &'a Git,
    uuid: &'a str,
    entries: Vec<StashEntry>,
}

impl<'a> StashGuard<'a> {
    fn new(git: &'a Git, uuid: &'a str) -> Self {
        Self {
            git,
            uuid,
            entries: Vec::new(),
        }
    }

    fn track(&mut self, entry: StashEntry) {
        self.entries.push(entry);
    }

    fn restore(&mut self) -> Result<Restore> {
        let mut result = Restore::Applied;
        while let Some(entry) = self.entries.pop() {
            if let StashPop::Conflict { stderr } = self.git.stash_pop(&entry.sha)? {
                let preserved_ref = format!("{PRESERVED_STASH_REF}/{}", self.uuid);
                error!(sha = %entry.sha, %stderr, %preserved_ref, "stash did not apply cleanly");
                self.git.reset_merge()?;
                self.git.update_ref(&preserved_ref, &entry.sha)?;
                self.git.stash_drop(&entry.sha)?;
                result = Restore::Conflict { preserved_ref };
            }
        }
        Ok(result)
    }
}

impl Drop for StashGuard<'_> {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        warn!(pending = self.entries.len(), "restoring stash on early exit");
        if let Err(err) = self.restore() {
            error!(error = %err, "failed to restore stash");
        }
    }
}
