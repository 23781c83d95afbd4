//! Policy violations raised by guardrails.
//!
//! These are programmer/policy errors rather than operational failures: they
//! propagate out of the tool call as `anyhow::Error` and callers that care can
//! `downcast_ref::<GuardrailViolation>()`.

use std::fmt;
use std::path::{Component, Path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailViolation {
    /// The per-turn call limit for a tool was exceeded.
    TooManyCalls { tool: String, turn: u32, limit: u32 },
    /// The per-run retry ceiling was exceeded.
    TooManyRetries { limit: u32 },
    /// The command could not be parsed into an argv.
    InvalidCommand { reason: String },
    /// A required identifier (correlation id, task id, ...) was missing.
    MissingIdentifier { field: &'static str },
    /// A sandboxed tool was invoked from inside another sandboxed execution.
    RecursiveSandbox,
    /// A commit was requested without a green test run recorded first.
    TestsNotGreen { last_exit: Option<i32> },
    /// A path escapes the repository or is absolute.
    InvalidPath { path: String },
}

impl fmt::Display for GuardrailViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyCalls { tool, turn, limit } => {
                write!(f, "tool '{tool}' exceeded {limit} calls in turn {turn}")
            }
            Self::TooManyRetries { limit } => write!(f, "retry limit of {limit} exceeded"),
            Self::InvalidCommand { reason } => write!(f, "invalid command: {reason}"),
            Self::MissingIdentifier { field } => write!(f, "missing required {field}"),
            Self::RecursiveSandbox => {
                write!(f, "refusing nested sandbox execution (AGENT_SANDBOX_ACTIVE)")
            }
            Self::TestsNotGreen { last_exit } => match last_exit {
                Some(code) => write!(f, "last test run exited {code}; commit refused"),
                None => write!(f, "no test run recorded; commit refused"),
            },
            Self::InvalidPath { path } => write!(f, "path '{path}' must be relative to the repo"),
        }
    }
}

impl std::error::Error for GuardrailViolation {}

/// Fail with `MissingIdentifier` when `value` is blank.
pub fn require_identifier(field: &'static str, value: &str) -> Result<(), GuardrailViolation> {
    if value.trim().is_empty() {
        return Err(GuardrailViolation::MissingIdentifier { field });
    }
    Ok(())
}

/// Fail with `InvalidPath` unless `path` is relative and stays inside its root.
pub fn require_relative_path(path: &Path) -> Result<(), GuardrailViolation> {
    let escapes = path.as_os_str().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(GuardrailViolation::InvalidPath {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_must_stay_inside_root() {
        assert!(require_relative_path(Path::new("artifacts/t-1.md")).is_ok());
        assert!(require_relative_path(Path::new("./notes.md")).is_ok());
        assert!(require_relative_path(Path::new("../escape.md")).is_err());
        assert!(require_relative_path(Path::new("a/../../b")).is_err());
        assert!(require_relative_path(Path::new("/etc/passwd")).is_err());
        assert!(require_relative_path(Path::new("")).is_err());
    }

    #[test]
    fn blank_identifier_is_rejected() {
        let err = require_identifier("task_id", "  ").expect_err("blank");
        assert_eq!(err, GuardrailViolation::MissingIdentifier { field: "task_id" });
        assert_eq!(err.to_string(), "missing required task_id");
    }

    #[test]
    fn tests_not_green_message_names_exit_code() {
        let err = GuardrailViolation::TestsNotGreen { last_exit: Some(2) };
        assert!(err.to_string().contains("exited 2"));
    }
}
