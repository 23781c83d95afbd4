//! Per-correlation git worktrees and out-of-process command execution.
//!
//! Each run gets its own checkout and branch so concurrent runs never fight
//! over one working tree. Commands always run in a child process bounded by a
//! hard timeout, and every child is marked with `AGENT_SANDBOX_ACTIVE=1` so
//! tools can refuse nested sandbox executions.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::violations::require_identifier;
use crate::io::config::{SANDBOX_ACTIVE_ENV, SandboxConfig};
use crate::io::git::{Git, is_branch_in_use};
use crate::io::process::{ExecReport, parse_exec_report, run_command_with_timeout};

/// Suffix attempts when deriving a free branch name.
const MAX_BRANCH_SUFFIX: u32 = 99;

/// An isolated checkout owned by one correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxWorktree {
    pub correlation_id: String,
    pub branch: String,
    /// Root of the worktree checkout.
    pub repo_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SandboxRunner {
    repo: Git,
    worktrees_root: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
    wrapper: Vec<String>,
}

impl SandboxRunner {
    pub fn new(repo_root: &Path, config: &SandboxConfig) -> Self {
        let worktrees_root = match &config.worktrees_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => repo_root.join(dir),
            None => default_worktrees_root(repo_root),
        };
        Self {
            repo: Git::new(repo_root),
            worktrees_root,
            timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            wrapper: config.wrapper.clone(),
        }
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    fn worktree_path(&self, correlation_id: &str) -> PathBuf {
        self.worktrees_root.join(sanitize(correlation_id))
    }

    /// Return the worktree for `correlation_id`, creating it on first use.
    ///
    /// `branch` is created from the main checkout's HEAD when absent. If it is
    /// already checked out in another worktree, a suffixed branch is derived
    /// from it instead.
    #[instrument(skip_all, fields(correlation_id, branch))]
    pub fn worktree(&self, correlation_id: &str, branch: &str) -> Result<SandboxWorktree> {
        require_identifier("correlation_id", correlation_id)?;
        require_identifier("branch", branch)?;
        let path = self.worktree_path(correlation_id);

        if let Some(existing) = self.find_registered(&path)? {
            let branch = match existing {
                Some(branch) => branch,
                None => Git::new(&path).current_branch()?,
            };
            debug!(path = %path.display(), %branch, "reusing worktree");
            return Ok(SandboxWorktree {
                correlation_id: correlation_id.to_string(),
                branch,
                repo_dir: path,
            });
        }

        fs::create_dir_all(&self.worktrees_root)
            .with_context(|| format!("create {}", self.worktrees_root.display()))?;

        let chosen = if self.repo.branch_exists(branch)? {
            let out = self.repo.worktree_add(&path, branch, None)?;
            if out.status.success() {
                branch.to_string()
            } else {
                let stderr = String::from_utf8_lossy(&out.stderr).to_string();
                if !is_branch_in_use(&stderr) {
                    return Err(anyhow!("git worktree add failed: {}", stderr.trim()));
                }
                let derived = self.derive_branch(branch, correlation_id)?;
                warn!(%branch, %derived, "branch checked out elsewhere, using derived branch");
                self.add_new_branch(&path, &derived, branch)?;
                derived
            }
        } else {
            self.add_new_branch(&path, branch, "HEAD")?;
            branch.to_string()
        };

        info!(path = %path.display(), branch = %chosen, "created worktree");
        Ok(SandboxWorktree {
            correlation_id: correlation_id.to_string(),
            branch: chosen,
            repo_dir: path,
        })
    }

    /// Remove the worktree for `correlation_id`. Returns `false` if none existed.
    #[instrument(skip_all, fields(correlation_id))]
    pub fn cleanup(&self, correlation_id: &str) -> Result<bool> {
        require_identifier("correlation_id", correlation_id)?;
        let path = self.worktree_path(correlation_id);
        if self.find_registered(&path)?.is_none() {
            return Ok(false);
        }
        self.repo.worktree_remove(&path)?;
        info!(path = %path.display(), "removed worktree");
        Ok(true)
    }

    /// Run `argv` inside `worktree` with the sandbox timeout.
    pub fn exec(&self, worktree: &SandboxWorktree, argv: &[String]) -> Result<ExecReport> {
        self.exec_in(&worktree.repo_dir, argv)
    }

    /// Run `argv` in `dir`, through the configured wrapper if any.
    ///
    /// When a wrapper is configured its stdout is expected to be an exec report;
    /// anything else falls back to the wrapper's own raw output.
    #[instrument(skip_all, fields(dir = %dir.display(), program = argv.first().map(String::as_str).unwrap_or("")))]
    pub fn exec_in(&self, dir: &Path, argv: &[String]) -> Result<ExecReport> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty argv"))?;

        let mut cmd = match self.wrapper.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut cmd = Command::new(wrapper);
                cmd.args(wrapper_args).arg(program).args(rest);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
        };
        cmd.current_dir(dir).env(SANDBOX_ACTIVE_ENV, "1");

        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)?;
        if output.timed_out {
            return Ok(output.to_report());
        }
        if !self.wrapper.is_empty() {
            if let Some(report) = parse_exec_report(&output.stdout) {
                return Ok(report);
            }
            warn!("wrapper emitted no structured report, using raw output");
        }
        let report = output.to_report();
        debug!(status = ?report.status, "sandbox command finished");
        Ok(report)
    }

    /// `Some(branch)` if `path` is a registered worktree of this repo.
    fn find_registered(&self, path: &Path) -> Result<Option<Option<String>>> {
        if !path.exists() {
            return Ok(None);
        }
        let wanted = canonical(path);
        Ok(self
            .repo
            .worktree_list()?
            .into_iter()
            .find(|entry| canonical(&entry.path) == wanted)
            .map(|entry| entry.branch))
    }

    fn add_new_branch(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let out = self.repo.worktree_add(path, branch, Some(base))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("git worktree add -b {branch} failed: {}", stderr.trim()));
        }
        Ok(())
    }

    fn derive_branch(&self, branch: &str, correlation_id: &str) -> Result<String> {
        let tag: String = sanitize(correlation_id).chars().take(8).collect();
        let base = format!("{branch}-{tag}");
        for n in 1..=MAX_BRANCH_SUFFIX {
            let candidate = if n == 1 {
                base.clone()
            } else {
                format!("{base}-{n}")
            };
            if !self.repo.branch_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(anyhow!("no free branch name derived from '{branch}'"))
    }
}

fn default_worktrees_root(repo_root: &Path) -> PathBuf {
    let name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    repo_root
        .parent()
        .unwrap_or(repo_root)
        .join(".conductor-worktrees")
        .join(name)
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::violations::GuardrailViolation;
    use crate::io::process::ExecStatus;
    use crate::test_support::TestRepo;

    fn runner(repo: &TestRepo) -> SandboxRunner {
        let config = SandboxConfig {
            worktrees_dir: Some(repo.scratch().join("worktrees")),
            command_timeout_secs: 5,
            ..SandboxConfig::default()
        };
        SandboxRunner::new(repo.path(), &config)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn creates_worktree_on_new_branch_and_reuses_it() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = runner(&repo);

        let first = sandbox.worktree("corr-1", "agent/corr-1").expect("worktree");
        assert_eq!(first.branch, "agent/corr-1");
        assert!(first.repo_dir.join("README.md").exists());
        assert!(repo.git().branch_exists("agent/corr-1").expect("exists"));

        let again = sandbox.worktree("corr-1", "ignored").expect("reuse");
        assert_eq!(again.repo_dir, first.repo_dir);
        assert_eq!(again.branch, "agent/corr-1");
    }

    #[test]
    fn derives_suffixed_branch_when_checked_out_elsewhere() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = runner(&repo);
        let main_branch = repo.git().current_branch().expect("branch");

        let tree = sandbox.worktree("corr-xyz", &main_branch).expect("worktree");

        assert_eq!(tree.branch, format!("{main_branch}-corr-xyz"));
        assert!(repo.git().branch_exists(&tree.branch).expect("exists"));
    }

    #[test]
    fn derived_branch_skips_existing_names() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = runner(&repo);
        let main_branch = repo.git().current_branch().expect("branch");
        repo.run_git(&["branch", &format!("{main_branch}-corr-abc")])
            .expect("branch");

        let tree = sandbox.worktree("corr-abc", &main_branch).expect("worktree");
        assert_eq!(tree.branch, format!("{main_branch}-corr-abc-2"));
    }

    #[test]
    fn exec_runs_in_worktree_with_sandbox_marker() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = runner(&repo);
        let tree = sandbox.worktree("corr-2", "agent/corr-2").expect("worktree");

        let report = sandbox
            .exec(&tree, &argv(&["sh", "-c", "echo $AGENT_SANDBOX_ACTIVE; ls"]))
            .expect("exec");

        assert_eq!(report.status, ExecStatus::Ok);
        assert!(report.stdout.starts_with("1\n"));
        assert!(report.stdout.contains("README.md"));
    }

    #[test]
    fn wrapper_report_is_parsed_and_raw_output_is_fallback() {
        let repo = TestRepo::new().expect("repo");
        let structured = SandboxRunner {
            wrapper: argv(&[
                "sh",
                "-c",
                r#"printf '{"status":"failed","stdout":"inner","stderr":"boom","exit_code":2}'"#,
                "wrapper",
            ]),
            ..runner(&repo)
        };
        let report = structured
            .exec_in(repo.path(), &argv(&["true"]))
            .expect("exec");
        assert_eq!(report.status, ExecStatus::Failed);
        assert_eq!(report.stdout, "inner");

        let raw = SandboxRunner {
            wrapper: argv(&["sh", "-c", "echo not json", "wrapper"]),
            ..runner(&repo)
        };
        let report = raw.exec_in(repo.path(), &argv(&["true"])).expect("exec");
        assert_eq!(report.status, ExecStatus::Ok);
        assert_eq!(report.stdout, "not json\n");
    }

    #[test]
    fn cleanup_removes_worktree() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = runner(&repo);
        let tree = sandbox.worktree("corr-3", "agent/corr-3").expect("worktree");

        assert!(sandbox.cleanup("corr-3").expect("cleanup"));
        assert!(!tree.repo_dir.exists());
        assert!(!sandbox.cleanup("corr-3").expect("second cleanup"));
    }

    #[test]
    fn blank_correlation_id_is_a_violation() {
        let repo = TestRepo::new().expect("repo");
        let err = runner(&repo).worktree(" ", "b").expect_err("violation");
        assert_eq!(
            err.downcast_ref::<GuardrailViolation>(),
            Some(&GuardrailViolation::MissingIdentifier {
                field: "correlation_id"
            })
        );
    }
}
