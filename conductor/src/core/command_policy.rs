//! Deny/allow evaluation for commands requested by agent tools.
//!
//! The deny-list is checked first and always wins: a command matching an unsafe
//! pattern is blocked even when an allow rule would also match.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::violations::GuardrailViolation;

/// Patterns that always block: deletion, remote git operations, network tools.
pub const DEFAULT_DENY: &[&str] = &[
    r"(^|[\s;&|(])(sudo\s+)?rm(\s|$)",
    r"\bgit\s+(push|pull|fetch|clone|remote)\b",
    r"(^|[\s;&|(])(curl|wget|ssh|scp|sftp|nc|netcat|telnet|ftp|rsync)(\s|$)",
    r"(^|[\s;&|(])sudo(\s|$)",
];

/// Read-only inspection and test commands.
pub const DEFAULT_ALLOW: &[&str] = &[
    r"^git\s+(status|diff|log|show)\b",
    r"^(ls|cat|head|tail|wc|grep)\b",
    r"^(bundle\s+exec\s+rspec|bin/rails\s+test|cargo\s+test|just\s+ci)\b",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Denylist,
    NotAllowlisted,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Denylist => "denylist",
            Self::NotAllowlisted => "not_allowlisted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed { argv: Vec<String> },
    Blocked { reason: BlockReason, rule: Option<String> },
}

/// Compiled deny/allow lists.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    deny: Vec<Regex>,
    allow: Vec<Regex>,
}

impl CommandPolicy {
    pub fn new<D: AsRef<str>, A: AsRef<str>>(deny: &[D], allow: &[A]) -> Result<Self> {
        Ok(Self {
            deny: compile(deny).context("compile deny-list")?,
            allow: compile(allow).context("compile allow-list")?,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_DENY, DEFAULT_ALLOW)
    }

    /// Classify `command`. Malformed input is a violation, not a block.
    pub fn evaluate(&self, command: &str) -> Result<PolicyDecision, GuardrailViolation> {
        let argv = split_command(command)?;
        let normalized = argv.join(" ");
        let canonical = canonical_form(&argv);

        if let Some(rule) = self.deny.iter().find(|re| {
            re.is_match(command) || re.is_match(&normalized) || re.is_match(&canonical)
        })
        {
            return Ok(PolicyDecision::Blocked {
                reason: BlockReason::Denylist,
                rule: Some(rule.as_str().to_string()),
            });
        }
        if !self.allow.iter().any(|re| re.is_match(&normalized)) {
            return Ok(PolicyDecision::Blocked {
                reason: BlockReason::NotAllowlisted,
                rule: None,
            });
        }
        Ok(PolicyDecision::Allowed { argv })
    }
}

/// Git options that come before the subcommand and take a separate value.
const GIT_VALUE_OPTIONS: &[&str] = &[
    "-C",
    "-c",
    "--git-dir",
    "--work-tree",
    "--namespace",
    "--exec-path",
    "--config-env",
];

/// Command line as the deny-list should see it: the program by file name
/// (`/bin/rm` is `rm`) and, for git, the subcommand right after `git`.
fn canonical_form(argv: &[String]) -> String {
    let Some((program, rest)) = argv.split_first() else {
        return String::new();
    };
    let program = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| program.clone());

    let mut args = rest.iter();
    let mut words = vec![program.clone()];
    if program == "git" {
        while let Some(arg) = args.as_slice().first() {
            if !arg.starts_with('-') {
                break;
            }
            args.next();
            if GIT_VALUE_OPTIONS.contains(&arg.as_str()) {
                args.next();
            }
        }
    }
    words.extend(args.cloned());
    words.join(" ")
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p.as_ref()).with_context(|| format!("invalid pattern '{}'", p.as_ref())))
        .collect()
}

/// Split a command line into argv, honoring single and double quotes.
///
/// No expansion or substitution is performed; the result is executed directly,
/// never through a shell.
pub fn split_command(command: &str) -> Result<Vec<String>, GuardrailViolation> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(GuardrailViolation::InvalidCommand {
            reason: "unterminated quote".to_string(),
        });
    }
    if in_word {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(GuardrailViolation::InvalidCommand {
            reason: "empty command".to_string(),
        });
    }
    Ok(argv)
}
