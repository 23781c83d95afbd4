//! Allow-listed shell commands, run inside the run's sandbox worktree.

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::command_policy::PolicyDecision;
use crate::core::types::RunContext;
use crate::io::sandbox::SandboxRunner;
use crate::tools::{ToolGuardrail, ToolKind, ToolResult, run_worktree};

pub struct SafeShellTool<'a> {
    guardrail: &'a ToolGuardrail,
    sandbox: &'a SandboxRunner,
}

impl<'a> SafeShellTool<'a> {
    pub fn new(guardrail: &'a ToolGuardrail, sandbox: &'a SandboxRunner) -> Self {
        Self { guardrail, sandbox }
    }

    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub fn run(&self, ctx: &mut RunContext, command: &str) -> Result<ToolResult> {
        self.guardrail.admit(ctx, ToolKind::SafeShell)?;

        let argv = match self.guardrail.classify(command)? {
            PolicyDecision::Blocked { reason, rule } => {
                info!(reason = reason.as_str(), "command blocked");
                return Ok(ToolResult::Blocked {
                    reason,
                    rule,
                    command: command.to_string(),
                });
            }
            PolicyDecision::Allowed { argv } => argv,
        };

        if !self.guardrail.executes() {
            return Ok(ToolResult::DryRun {
                command: command.to_string(),
                argv,
            });
        }

        let worktree = run_worktree(self.sandbox, ctx)?;
        let report = self.sandbox.exec(&worktree, &argv)?;
        info!(status = ?report.status, "command executed");
        Ok(ToolResult::Executed {
            command: command.to_string(),
            report,
        })
    }

    /// Re-run a command after a failure, counting against the retry ceiling.
    pub fn retry(&self, ctx: &mut RunContext, command: &str) -> Result<ToolResult> {
        self.guardrail.retry(ctx)?;
        self.run(ctx, command)
    }
}
