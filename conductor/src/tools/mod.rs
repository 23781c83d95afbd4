//! Agent tools and the guardrail every tool call passes through.
//!
//! Before any tool body runs, [`ToolGuardrail::admit`] checks the run's
//! identifiers, refuses nested sandbox executions, and counts the call against
//! the tool's per-turn limit. Tools then describe instead of execute unless
//! `AI_TOOLS_EXECUTE` is set.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::command_policy::{BlockReason, CommandPolicy, PolicyDecision};
use crate::core::types::RunContext;
use crate::core::violations::{GuardrailViolation, require_identifier};
use crate::io::config::{Toggles, ToolsConfig};
use crate::io::process::ExecReport;
use crate::io::sandbox::{SandboxRunner, SandboxWorktree};

pub mod commit;
pub mod run_tests;
pub mod safe_shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    SafeShell,
    RunTests,
    Commit,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SafeShell => "safe_shell",
            Self::RunTests => "run_tests",
            Self::Commit => "commit",
        }
    }

    /// Tools that start a sandboxed child process.
    fn spawns_sandbox(&self) -> bool {
        matches!(self, Self::SafeShell | Self::RunTests)
    }
}

/// What a tool did (or would have done).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolResult {
    Blocked {
        reason: BlockReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        rule: Option<String>,
        command: String,
    },
    DryRun {
        command: String,
        argv: Vec<String>,
    },
    Executed {
        command: String,
        #[serde(flatten)]
        report: ExecReport,
    },
    Committed {
        commit_hash: String,
        branch: String,
    },
    NothingToCommit {
        branch: String,
    },
}

impl ToolResult {
    pub fn action(&self) -> &'static str {
        match self {
            Self::Blocked { .. } => "blocked",
            Self::DryRun { .. } => "dry_run",
            Self::Executed { .. } => "executed",
            Self::Committed { .. } => "committed",
            Self::NothingToCommit { .. } => "nothing_to_commit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolGuardrail {
    policy: CommandPolicy,
    config: ToolsConfig,
    toggles: Toggles,
}

impl ToolGuardrail {
    pub fn new(config: &ToolsConfig, toggles: Toggles) -> Result<Self> {
        Ok(Self {
            policy: CommandPolicy::new(&config.deny, &config.allow)?,
            config: config.clone(),
            toggles,
        })
    }

    /// True when tools should actually run commands.
    pub fn executes(&self) -> bool {
        self.toggles.tools_execute
    }

    pub fn limit(&self, tool: ToolKind) -> u32 {
        match tool {
            ToolKind::SafeShell => self.config.shell_max_calls,
            ToolKind::RunTests => self.config.tests_max_calls,
            ToolKind::Commit => self.config.commit_max_calls,
        }
    }

    /// Checks shared by every tool call, run before the tool body.
    pub fn admit(&self, ctx: &mut RunContext, tool: ToolKind) -> Result<()> {
        require_identifier("correlation_id", &ctx.correlation_id)?;
        if tool.spawns_sandbox() && self.toggles.sandbox_active {
            warn!(tool = tool.name(), "nested sandbox execution refused");
            return Err(GuardrailViolation::RecursiveSandbox.into());
        }
        let count = ctx.ledger.record_call(tool.name(), self.limit(tool))?;
        debug!(tool = tool.name(), turn = ctx.ledger.turn, count, "tool call admitted");
        Ok(())
    }

    /// Count a retry against the run's ceiling.
    pub fn retry(&self, ctx: &mut RunContext) -> Result<u32> {
        Ok(ctx.ledger.record_retry(self.config.max_retries)?)
    }

    pub fn classify(&self, command: &str) -> Result<PolicyDecision> {
        Ok(self.policy.evaluate(command)?)
    }

    /// Commits are only allowed after a recorded test run exited 0.
    pub fn require_green_tests(&self, ctx: &RunContext) -> Result<()> {
        if !ctx.ledger.tests_green() {
            return Err(GuardrailViolation::TestsNotGreen {
                last_exit: ctx.ledger.last_test_exit,
            }
            .into());
        }
        Ok(())
    }
}

/// Worktree for the run, on `ctx.branch` or `conductor/<correlation_id>`.
pub(crate) fn run_worktree(sandbox: &SandboxRunner, ctx: &RunContext) -> Result<SandboxWorktree> {
    let branch = ctx
        .branch
        .clone()
        .unwrap_or_else(|| format!("conductor/{}", ctx.correlation_id));
    sandbox.worktree(&ctx.correlation_id, &branch)
}
