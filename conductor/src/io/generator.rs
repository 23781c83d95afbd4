//! Generation and scoring backends.
//!
//! The engines only see the [`Generator`] and [`Scorer`] traits. The command
//! backends here pipe the prompt to an external program on stdin, which is how
//! a real model CLI gets plugged in; tests use the scripted fakes in
//! `test_support` instead.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Environment variable carrying the model id to a generator command.
pub const MODEL_ENV: &str = "CONDUCTOR_MODEL";
/// Environment variable carrying the 1-based iteration number.
pub const ITERATION_ENV: &str = "CONDUCTOR_ITERATION";

/// Produces one candidate output for `context` with `model`.
pub trait Generator {
    fn generate(&self, context: &str, iteration: u32, model: &str) -> Result<String>;
}

/// Rates an output against its context on a 0..=100 scale.
pub trait Scorer {
    fn score(&self, output: &str, context: &str) -> Result<f64>;
}

impl<T: Generator + ?Sized> Generator for &T {
    fn generate(&self, context: &str, iteration: u32, model: &str) -> Result<String> {
        (**self).generate(context, iteration, model)
    }
}

impl<T: Scorer + ?Sized> Scorer for &T {
    fn score(&self, output: &str, context: &str) -> Result<f64> {
        (**self).score(output, context)
    }
}

/// Command invocation shared by the command-backed generator and scorer.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self {
                argv,
                timeout,
                output_limit_bytes,
            }),
            _ => Err(anyhow!("command must be a non-empty array")),
        }
    }

    fn run(&self, stdin: &str, env: &[(&str, String)]) -> Result<String> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let output = run_command_with_timeout(
            cmd,
            Some(stdin.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )?;
        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "command timed out");
            return Err(anyhow!("{} timed out after {:?}", self.argv[0], self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} failed with status {:?}: {}",
                self.argv[0],
                output.status.code(),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Pipes the context to a command and takes its stdout as the output.
///
/// The model id and iteration are passed through [`MODEL_ENV`] and
/// [`ITERATION_ENV`].
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    spec: CommandSpec,
}

impl CommandGenerator {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(iteration, model))]
    fn generate(&self, context: &str, iteration: u32, model: &str) -> Result<String> {
        let env = [
            (MODEL_ENV, model.to_string()),
            (ITERATION_ENV, iteration.to_string()),
        ];
        let output = self.spec.run(context, &env)?;
        debug!(bytes = output.len(), "generated output");
        Ok(output)
    }
}

/// Pipes `context`, a blank line, then `output` to a command and parses the
/// first number it prints.
#[derive(Debug, Clone)]
pub struct CommandScorer {
    spec: CommandSpec,
}

impl CommandScorer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Scorer for CommandScorer {
    #[instrument(skip_all)]
    fn score(&self, output: &str, context: &str) -> Result<f64> {
        let stdin = format!("{context}\n\n{output}");
        let raw = self.spec.run(&stdin, &[])?;
        parse_score(&raw)
    }
}

/// First whitespace-separated token of `raw` that parses as a finite number.
pub fn parse_score(raw: &str) -> Result<f64> {
    raw.split_whitespace()
        .find_map(|token| token.parse::<f64>().ok().filter(|v| v.is_finite()))
        .ok_or_else(|| anyhow!("scorer printed no number: '{}'", raw.trim()))
}
