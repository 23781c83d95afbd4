//! Git adapter for the engine.
//!
//! Commits, stashes, pushes, and worktrees are all driven through the `git`
//! CLI so behavior matches what a developer sees in their own checkout.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Commit-message trailer that marks a commit as the result of one logical attempt.
pub const IDEMPOTENCY_TRAILER: &str = "Idempotency-UUID";

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One line of `git stash list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// Reflog selector, e.g. `stash@{0}`.
    pub selector: String,
    pub sha: String,
    pub subject: String,
}

/// Result of applying a stash back onto the worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StashPop {
    Applied,
    /// The apply failed; git keeps the stash entry in this case.
    Conflict { stderr: String },
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name, `None` when detached.
    pub branch: Option<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True when there are no tracked changes and no untracked files.
    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Stage a single path.
    pub fn add_path(&self, path: &Path) -> Result<()> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))?;
        self.run_checked(&["add", "--", path])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a subject and body, returning the new HEAD SHA.
    #[instrument(skip_all)]
    pub fn commit(&self, subject: &str, body: &str) -> Result<String> {
        debug!(subject, "committing staged changes");
        self.run_checked(&["commit", "-m", subject, "-m", body])?;
        self.head_sha()
    }

    /// SHAs of commits (on any ref) whose message carries the idempotency trailer for `uuid`.
    #[instrument(skip_all, fields(uuid))]
    pub fn commits_with_idempotency_uuid(&self, uuid: &str) -> Result<Vec<String>> {
        let needle = format!("{IDEMPOTENCY_TRAILER}: {uuid}");
        let grep = format!("--grep={needle}");
        // The grep is a substring prefilter; exact matching happens on the message lines.
        let out = self.run_capture(&[
            "log",
            "--all",
            "--fixed-strings",
            &grep,
            "--format=%H%x1f%B%x1e",
        ])?;
        let shas = commits_with_line(&out, &needle);
        debug!(matches = shas.len(), "idempotency lookup");
        Ok(shas)
    }

    /// Stash tracked and untracked changes under `message`.
    ///
    /// Returns the created entry, or `None` if git had nothing to stash.
    #[instrument(skip_all)]
    pub fn stash_push(&self, message: &str) -> Result<Option<StashEntry>> {
        let before = self.stash_list()?.len();
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        let entries = self.stash_list()?;
        if entries.len() == before {
            debug!("nothing to stash");
            return Ok(None);
        }
        Ok(entries.into_iter().next())
    }

    pub fn stash_list(&self) -> Result<Vec<StashEntry>> {
        let out = self.run_capture(&["stash", "list", "--format=%gd%x00%H%x00%s"])?;
        out.lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_stash_line)
            .collect()
    }

    /// Current selector of the stash with `sha`, if it is still in the stash list.
    pub fn stash_selector(&self, sha: &str) -> Result<Option<String>> {
        Ok(self
            .stash_list()?
            .into_iter()
            .find(|e| e.sha == sha)
            .map(|e| e.selector))
    }

    /// Pop the stash with `sha` back onto the worktree.
    #[instrument(skip_all, fields(sha))]
    pub fn stash_pop(&self, sha: &str) -> Result<StashPop> {
        let selector = self
            .stash_selector(sha)?
            .ok_or_else(|| anyhow!("stash {sha} not found"))?;
        let out = self.run(&["stash", "pop", &selector])?;
        if out.status.success() {
            return Ok(StashPop::Applied);
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        warn!(%selector, %stderr, "stash pop failed");
        Ok(StashPop::Conflict { stderr })
    }

    pub fn stash_drop(&self, sha: &str) -> Result<()> {
        if let Some(selector) = self.stash_selector(sha)? {
            self.run_checked(&["stash", "drop", &selector])?;
        }
        Ok(())
    }

    /// Point `refname` at `sha` (used to keep a stash reachable after dropping it).
    pub fn update_ref(&self, refname: &str, sha: &str) -> Result<()> {
        self.run_checked(&["update-ref", refname, sha])?;
        Ok(())
    }

    /// Abort a half-applied merge/stash, keeping unrelated local changes.
    pub fn reset_merge(&self) -> Result<()> {
        self.run_checked(&["reset", "--merge"])?;
        Ok(())
    }

    /// Push `HEAD` to `remote`/`branch`.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_head(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", remote, &refspec])?;
        Ok(())
    }

    /// Add a worktree at `path` checking out `branch`.
    ///
    /// With `create_from = Some(base)` the branch is created from `base` first.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str, create_from: Option<&str>) -> Result<Output> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        let args: Vec<&str> = match create_from {
            Some(base) => vec!["worktree", "add", "-b", branch, path, base],
            None => vec!["worktree", "add", path, branch],
        };
        self.run(&args)
    }

    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        self.run_checked(&["worktree", "remove", "--force", path])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// SHAs from `%H%x1f%B%x1e` log output whose message has a line equal to `line`.
fn commits_with_line(log: &str, line: &str) -> Vec<String> {
    log.split('\x1e')
        .filter_map(|record| record.trim_start().split_once('\x1f'))
        .filter(|(_, message)| message.lines().any(|l| l.trim() == line))
        .map(|(sha, _)| sha.trim().to_string())
        .collect()
}

/// True when `git worktree add` refused because the branch is checked out elsewhere.
pub fn is_branch_in_use(stderr: &str) -> bool {
    stderr.contains("already checked out") || stderr.contains("already used by worktree")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_stash_line(line: &str) -> Result<StashEntry> {
    let mut parts = line.splitn(3, '\0');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(selector), Some(sha), Some(subject)) => Ok(StashEntry {
            selector: selector.to_string(),
            sha: sha.to_string(),
            subject: subject.to_string(),
        }),
        _ => Err(anyhow!("unexpected stash list line: '{line}'")),
    }
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                entries.push(done);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ")
            && let Some(entry) = current.as_mut()
        {
            let short = reference.strip_prefix("refs/heads/").unwrap_or(reference);
            entry.branch = Some(short.to_string());
        }
    }
    if let Some(done) = current {
        entries.push(done);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_lookup_requires_exact_value() {
        let log = "aaa\x1fjob 10\n\nIdempotency-UUID: job-10\n\x1e\nbbb\x1fjob 1\n\nIdempotency-UUID: job-1\n\x1e\n";
        assert_eq!(commits_with_line(log, "Idempotency-UUID: job-1"), vec!["bbb"]);
        assert_eq!(commits_with_line(log, "Idempotency-UUID: job-10"), vec!["aaa"]);
        assert!(commits_with_line(log, "Idempotency-UUID: job").is_empty());
        assert!(commits_with_line("", "Idempotency-UUID: job-1").is_empty());
    }

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn parses_stash_line() {
        let e = parse_stash_line("stash@{1}\0abc123\0On main: conductor handshake").expect("parse");
        assert_eq!(e.selector, "stash@{1}");
        assert_eq!(e.sha, "abc123");
        assert_eq!(e.subject, "On main: conductor handshake");
    }

    #[test]
    fn parses_worktree_porcelain() {
        let out = "worktree /repo\nHEAD aaa\nbranch refs/heads/main\n\nworktree /repo/.wt/x\nHEAD bbb\ndetached\n\n";
        let entries = parse_worktree_list(out);
        assert_eq!(
            entries,
            vec![
                WorktreeEntry {
                    path: PathBuf::from("/repo"),
                    branch: Some("main".to_string())
                },
                WorktreeEntry {
                    path: PathBuf::from("/repo/.wt/x"),
                    branch: None
                },
            ]
        );
    }

    #[test]
    fn detects_branch_in_use_messages() {
        assert!(is_branch_in_use(
            "fatal: 'feature' is already checked out at '/repo'"
        ));
        assert!(is_branch_in_use(
            "fatal: 'feature' is already used by worktree at '/repo'"
        ));
        assert!(!is_branch_in_use("fatal: invalid reference: nope"));
    }
}
