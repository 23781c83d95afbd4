//! Commit tool: stages everything in the run's worktree once tests are green.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::types::RunContext;
use crate::handshake::CORRELATION_TRAILER;
use crate::io::git::Git;
use crate::io::sandbox::SandboxRunner;
use crate::tools::{ToolGuardrail, ToolKind, ToolResult, run_worktree};

pub struct CommitTool<'a> {
    guardrail: &'a ToolGuardrail,
    sandbox: &'a SandboxRunner,
}

impl<'a> CommitTool<'a> {
    pub fn new(guardrail: &'a ToolGuardrail, sandbox: &'a SandboxRunner) -> Self {
        Self { guardrail, sandbox }
    }

    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub fn run(&self, ctx: &mut RunContext, message: &str) -> Result<ToolResult> {
        self.guardrail.admit(ctx, ToolKind::Commit)?;
        self.guardrail.require_green_tests(ctx)?;

        let subject = match message.trim() {
            "" => "conductor: agent changes".to_string(),
            text => match &ctx.task_id {
                Some(task_id) => format!("{task_id}: {text}"),
                None => text.to_string(),
            },
        };
        let body = format!("{CORRELATION_TRAILER}: {}", ctx.correlation_id);

        if !self.guardrail.executes() {
            return Ok(ToolResult::DryRun {
                command: format!("git commit -m {subject:?}"),
                argv: vec![
                    "git".to_string(),
                    "commit".to_string(),
                    "-m".to_string(),
                    subject,
                    "-m".to_string(),
                    body,
                ],
            });
        }

        let worktree = run_worktree(self.sandbox, ctx)?;
        let git = Git::new(&worktree.repo_dir);
        git.add_path(Path::new("."))?;
        if !git.has_staged_changes()? {
            return Ok(ToolResult::NothingToCommit {
                branch: worktree.branch,
            });
        }
        let commit_hash = git.commit(&subject, &body)?;
        info!(%commit_hash, branch = %worktree.branch, "committed worktree changes");
        Ok(ToolResult::Committed {
            commit_hash,
            branch: worktree.branch,
        })
    }
}
