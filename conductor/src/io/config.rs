//! Engine configuration stored under `.conductor/config.toml`, plus the
//! environment toggles read once per process.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::command_policy::{DEFAULT_ALLOW, DEFAULT_DENY};
use crate::core::pruning::PruningConfig;
use crate::core::routing::RoutingConfig;

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// engine was tuned with.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub routing: RoutingConfig,
    pub iteration: IterationConfig,
    pub adaptive: AdaptiveConfig,
    pub conductor: ConductorConfig,
    pub pruning: PruningConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
    pub handshake: HandshakeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IterationConfig {
    /// Hard cap on generate/evaluate rounds per run.
    pub iteration_cap: u32,
    pub score_stop_threshold: f64,
    pub score_escalate_threshold: f64,
    /// Escalate when one output alone is estimated above this many tokens.
    pub escalate_output_tokens: usize,
    /// Per-iteration token budget (context + output) for the fixed engine.
    pub token_budget: usize,
    /// Sleeps between attempts, consumed in order; the last entry repeats.
    pub backoff_ms: Vec<u64>,
    /// Default escalation target (overridden by `ESCALATE_LLM`).
    pub escalation_model: String,
    /// Contexts estimated above this are pruned before generation.
    pub context_window_tokens: usize,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            iteration_cap: 7,
            score_stop_threshold: 80.0,
            score_escalate_threshold: 70.0,
            escalate_output_tokens: 500,
            token_budget: 8_000,
            backoff_ms: vec![150, 300],
            escalation_model: "grok-4.1".to_string(),
            context_window_tokens: 32_000,
        }
    }
}

impl IterationConfig {
    /// Backoff before retrying after `completed` attempts (1-indexed).
    pub fn backoff_after(&self, completed: u32) -> Duration {
        let idx = completed.saturating_sub(1) as usize;
        let ms = self
            .backoff_ms
            .get(idx)
            .or(self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Escalation order; the entry after the last wraps to the first.
    pub escalation_chain: Vec<String>,
    pub max_escalations: u32,
    /// Token budget summed across every iteration of a run.
    pub total_token_budget: usize,
    /// Multiplier applied to the first score after an escalation.
    pub post_escalation_penalty: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            escalation_chain: vec![
                "grok-4.1".to_string(),
                "claude-sonnet-4.5".to_string(),
                "ollama".to_string(),
            ],
            max_escalations: 1,
            total_token_budget: 24_000,
            post_escalation_penalty: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConductorConfig {
    pub stage_timeout_ms: u64,
    /// Consecutive non-ok stages that trip the circuit breaker.
    pub failure_streak_limit: u32,
    pub refiner_iterations: u32,
    pub max_jobs: u32,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: 1_000,
            failure_streak_limit: 3,
            refiner_iterations: 3,
            max_jobs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Worktrees are created under this directory (relative paths resolve
    /// against the repo root). Defaults to a sibling `.conductor-worktrees/<repo>`.
    pub worktrees_dir: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Optional wrapper argv prepended to every command (e.g. `["conductor", "wrap", "--"]`).
    pub wrapper: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worktrees_dir: None,
            command_timeout_secs: 120,
            output_limit_bytes: 100_000,
            wrapper: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub shell_max_calls: u32,
    pub tests_max_calls: u32,
    pub commit_max_calls: u32,
    pub max_retries: u32,
    pub deny: Vec<String>,
    pub allow: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell_max_calls: 5,
            tests_max_calls: 10,
            commit_max_calls: 5,
            max_retries: 2,
            deny: DEFAULT_DENY.iter().map(|s| s.to_string()).collect(),
            allow: DEFAULT_ALLOW.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Remote to push to (overridden by `GIT_REMOTE`).
    pub remote: String,
    pub stash_attempts: u32,
    /// Default directory for artifacts when no explicit path is given.
    pub artifact_dir: PathBuf,
    /// Test suite command (e.g. `["just","ci"]`).
    pub test_command: Vec<String>,
    pub test_timeout_secs: u64,
    pub test_output_limit_bytes: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            stash_attempts: 3,
            artifact_dir: PathBuf::from("artifacts"),
            test_command: vec!["just".to_string(), "ci".to_string()],
            test_timeout_secs: 30 * 60,
            test_output_limit_bytes: 100_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        self.pruning.validate()?;

        let it = &self.iteration;
        if it.iteration_cap == 0 {
            return Err(anyhow!("iteration.iteration_cap must be > 0"));
        }
        if it.backoff_ms.is_empty() {
            return Err(anyhow!("iteration.backoff_ms must be a non-empty array"));
        }
        if it.token_budget == 0 || it.context_window_tokens == 0 {
            return Err(anyhow!("iteration token budgets must be > 0"));
        }
        if it.score_escalate_threshold > it.score_stop_threshold {
            return Err(anyhow!(
                "iteration.score_escalate_threshold must not exceed score_stop_threshold"
            ));
        }
        if it.escalation_model.trim().is_empty() {
            return Err(anyhow!("iteration.escalation_model must be non-empty"));
        }

        let ad = &self.adaptive;
        if ad.escalation_chain.is_empty() {
            return Err(anyhow!("adaptive.escalation_chain must be a non-empty array"));
        }
        if !(0.0..=1.0).contains(&ad.post_escalation_penalty) {
            return Err(anyhow!("adaptive.post_escalation_penalty must be within [0, 1]"));
        }

        if self.conductor.stage_timeout_ms == 0 {
            return Err(anyhow!("conductor.stage_timeout_ms must be > 0"));
        }
        if self.conductor.failure_streak_limit == 0 {
            return Err(anyhow!("conductor.failure_streak_limit must be > 0"));
        }
        if self.sandbox.command_timeout_secs == 0 || self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox timeout and output limit must be > 0"));
        }
        if self.handshake.stash_attempts == 0 {
            return Err(anyhow!("handshake.stash_attempts must be > 0"));
        }
        if self.handshake.test_command.is_empty() || self.handshake.test_command[0].trim().is_empty()
        {
            return Err(anyhow!("handshake.test_command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Environment toggles, captured once so call sites never read the process env.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toggles {
    /// `DRY_RUN`: skip the push in the queue handshake.
    pub dry_run: bool,
    /// `AI_TOOLS_EXECUTE`: tools actually run commands instead of describing them.
    pub tools_execute: bool,
    /// `AGENT_SANDBOX_ACTIVE`: this process already runs inside a sandboxed command.
    pub sandbox_active: bool,
    /// `GIT_REMOTE`: push target override.
    pub git_remote: Option<String>,
    /// `ESCALATE_LLM`: escalation model override.
    pub escalate_llm: Option<String>,
}

pub const SANDBOX_ACTIVE_ENV: &str = "AGENT_SANDBOX_ACTIVE";

impl Toggles {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let flag = |key: &str| lookup(key).map(|v| is_truthy(&v)).unwrap_or(false);
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            dry_run: flag("DRY_RUN"),
            tools_execute: flag("AI_TOOLS_EXECUTE"),
            sandbox_active: flag(SANDBOX_ACTIVE_ENV),
            git_remote: text("GIT_REMOTE"),
            escalate_llm: text("ESCALATE_LLM"),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Well-known paths under a repository root.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub resume_dir: PathBuf,
    pub backlog_path: PathBuf,
}

impl EnginePaths {
    pub fn new(root: &Path) -> Self {
        let base = root.join(".conductor");
        let state_dir = base.join("state");
        Self {
            root: root.to_path_buf(),
            gitignore_path: base.join(".gitignore"),
            config_path: base.join("config.toml"),
            resume_dir: state_dir.join("resume"),
            backlog_path: state_dir.join("backlog.json"),
            state_dir,
        }
    }
}

impl EnginePaths {
    /// Create the state directories and keep them out of git status.
    ///
    /// The ignore file lists itself so `.conductor/` never makes a checkout dirty.
    pub fn ensure_state_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.resume_dir)
            .with_context(|| format!("create directory {}", self.resume_dir.display()))?;
        if !self.gitignore_path.exists() {
            fs::write(&self.gitignore_path, STATE_GITIGNORE)
                .with_context(|| format!("write {}", self.gitignore_path.display()))?;
        }
        Ok(())
    }
}

const STATE_GITIGNORE: &str = "state/\n.gitignore\n";

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!("{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
