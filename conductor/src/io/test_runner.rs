//! Test-suite runner used to gate pushes and commits.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Outcome of one test-suite run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// `None` when the process was killed (timeout) or died by signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub log: String,
}

impl TestOutcome {
    pub fn green(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome>;
}

/// Runs a configured command (e.g. `just ci`) in the request's workdir.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Vec<String>,
}

impl CommandTestRunner {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(anyhow!("test command must be a non-empty array"));
        }
        Ok(Self { command })
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(command = %self.command.join(" ")))]
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).current_dir(&request.workdir);
        let output =
            run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)?;

        let report = output.to_report();
        let mut log = String::new();
        log.push_str("=== stdout ===\n");
        log.push_str(&report.stdout);
        log.push_str("\n=== stderr ===\n");
        log.push_str(&report.stderr);
        if output.timed_out {
            log.push_str("\n[tests timed out]\n");
        }

        let outcome = TestOutcome {
            exit_code: if output.timed_out { None } else { output.status.code() },
            timed_out: output.timed_out,
            log,
        };
        if outcome.green() {
            info!("test suite passed");
        } else {
            warn!(exit_code = ?outcome.exit_code, timed_out = outcome.timed_out, "test suite failed");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &std::path::Path) -> TestRequest {
        TestRequest {
            workdir: dir.to_path_buf(),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1_000,
        }
    }

    #[test]
    fn passing_command_is_green() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(vec!["true".to_string()]).expect("runner");
        let outcome = runner.run(&request(temp.path())).expect("run");
        assert!(outcome.green());
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[test]
    fn failing_command_records_exit_code_and_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo broken >&2; exit 4".to_string(),
        ])
        .expect("runner");
        let outcome = runner.run(&request(temp.path())).expect("run");
        assert!(!outcome.green());
        assert_eq!(outcome.exit_code, Some(4));
        assert!(outcome.log.contains("broken"));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandTestRunner::new(Vec::new()).is_err());
    }
}
