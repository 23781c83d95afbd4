//! Test-suite tool. Its exit code gates the commit tool.

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::core::types::RunContext;
use crate::io::sandbox::SandboxRunner;
use crate::tools::{ToolGuardrail, ToolKind, ToolResult, run_worktree};

pub struct RunTestsTool<'a> {
    guardrail: &'a ToolGuardrail,
    sandbox: &'a SandboxRunner,
    command: Vec<String>,
}

impl<'a> RunTestsTool<'a> {
    pub fn new(
        guardrail: &'a ToolGuardrail,
        sandbox: &'a SandboxRunner,
        command: Vec<String>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("test command must not be empty"));
        }
        Ok(Self {
            guardrail,
            sandbox,
            command,
        })
    }

    #[instrument(skip_all, fields(correlation_id = %ctx.correlation_id))]
    pub fn run(&self, ctx: &mut RunContext) -> Result<ToolResult> {
        self.guardrail.admit(ctx, ToolKind::RunTests)?;
        let command = self.command.join(" ");

        if !self.guardrail.executes() {
            return Ok(ToolResult::DryRun {
                command,
                argv: self.command.clone(),
            });
        }

        let worktree = run_worktree(self.sandbox, ctx)?;
        let report = self.sandbox.exec(&worktree, &self.command)?;
        ctx.ledger.record_test_exit(report.exit_code);
        info!(exit_code = ?report.exit_code, "tests finished");
        Ok(ToolResult::Executed { command, report })
    }

    pub fn retry(&self, ctx: &mut RunContext) -> Result<ToolResult> {
        self.guardrail.retry(ctx)?;
        self.run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::{SandboxConfig, Toggles, ToolsConfig};
    use crate::io::process::ExecStatus;
    use crate::test_support::TestRepo;

    fn sandbox(repo: &TestRepo) -> SandboxRunner {
        let config = SandboxConfig {
            worktrees_dir: Some(repo.scratch().join("worktrees")),
            command_timeout_secs: 5,
            ..SandboxConfig::default()
        };
        SandboxRunner::new(repo.path(), &config)
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn executing() -> Toggles {
        Toggles {
            tools_execute: true,
            ..Toggles::default()
        }
    }

    #[test]
    fn records_exit_code_of_each_run() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = sandbox(&repo);
        let guard = ToolGuardrail::new(&ToolsConfig::default(), executing()).expect("guard");
        let mut ctx = RunContext::new("cid-t", "ollama");

        let failing = RunTestsTool::new(&guard, &sandbox, sh("exit 3")).expect("tool");
        let ToolResult::Executed { report, .. } = failing.run(&mut ctx).expect("run") else {
            panic!("expected executed");
        };
        assert_eq!(report.status, ExecStatus::Failed);
        assert_eq!(ctx.ledger.last_test_exit, Some(3));
        assert!(!ctx.ledger.tests_green());

        let passing = RunTestsTool::new(&guard, &sandbox, sh("test -f README.md")).expect("tool");
        passing.retry(&mut ctx).expect("retry");
        assert!(ctx.ledger.tests_green());
    }

    #[test]
    fn dry_run_leaves_test_state_untouched() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = sandbox(&repo);
        let guard = ToolGuardrail::new(&ToolsConfig::default(), Toggles::default()).expect("guard");
        let tool = RunTestsTool::new(&guard, &sandbox, sh("exit 0")).expect("tool");
        let mut ctx = RunContext::new("cid-t", "ollama");

        let result = tool.run(&mut ctx).expect("run");
        assert_eq!(result.action(), "dry_run");
        assert_eq!(ctx.ledger.last_test_exit, None);
        assert_eq!(ctx.ledger.calls_this_turn("run_tests"), 1);
    }

    #[test]
    fn rejects_empty_command() {
        let repo = TestRepo::new().expect("repo");
        let sandbox = sandbox(&repo);
        let guard = ToolGuardrail::new(&ToolsConfig::default(), Toggles::default()).expect("guard");
        assert!(RunTestsTool::new(&guard, &sandbox, Vec::new()).is_err());
    }
}
