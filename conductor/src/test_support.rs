//! Test-only helpers: throwaway git repos and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::generator::{Generator, Scorer};
use crate::io::git::Git;
use crate::io::test_runner::{TestOutcome, TestRequest, TestRunner};
use crate::iterate::Sleeper;

/// A temp directory holding a git repo (`repo/`) with one commit on `main`,
/// plus a scratch area (`scratch/`) outside the repo.
pub struct TestRepo {
    _temp: TempDir,
    repo: PathBuf,
    scratch: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = temp.path().join("repo");
        let scratch = temp.path().join("scratch");
        fs::create_dir_all(&repo).context("create repo dir")?;
        fs::create_dir_all(&scratch).context("create scratch dir")?;

        let this = Self {
            _temp: temp,
            repo,
            scratch,
        };
        this.run_git(&["init", "-b", "main"])?;
        this.run_git(&["config", "user.email", "test@example.com"])?;
        this.run_git(&["config", "user.name", "test"])?;
        this.write("README.md", "hi\n")?;
        this.run_git(&["add", "README.md"])?;
        this.run_git(&["commit", "-m", "chore: init"])?;
        Ok(this)
    }

    /// New repo with a bare `origin` remote that `main` tracks.
    pub fn with_remote() -> Result<Self> {
        let this = Self::new()?;
        let remote = this.scratch.join("origin.git");
        let remote_str = remote.to_string_lossy().to_string();
        let status = Command::new("git")
            .args(["init", "--bare", &remote_str])
            .status()
            .context("git init --bare")?;
        if !status.success() {
            return Err(anyhow!("git init --bare failed"));
        }
        this.run_git(&["remote", "add", "origin", &remote_str])?;
        this.run_git(&["push", "origin", "main"])?;
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.repo
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn git(&self) -> Git {
        Git::new(&self.repo)
    }

    /// Path of the bare remote created by [`TestRepo::with_remote`].
    pub fn remote_path(&self) -> PathBuf {
        self.scratch.join("origin.git")
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.repo.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.repo.join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Run git in the repo, returning trimmed stdout.
    pub fn run_git(&self, args: &[&str]) -> Result<String> {
        run_git_in(&self.repo, args)
    }

    pub fn commit_count(&self) -> Result<usize> {
        Ok(self.run_git(&["rev-list", "--count", "HEAD"])?.parse()?)
    }

    pub fn stash_count(&self) -> Result<usize> {
        Ok(self.git().stash_list()?.len())
    }
}

pub fn run_git_in(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// One recorded `generate` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateCall {
    pub context: String,
    pub iteration: u32,
    pub model: String,
}

/// Returns scripted outputs in order; `Err` entries become generation failures.
///
/// Once the script is exhausted the fallback (if any) is returned forever.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    calls: Mutex<Vec<GenerateCall>>,
}

impl ScriptedGenerator {
    pub fn new<I, T>(outputs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::with_results(outputs.into_iter().map(|o| Ok(o.into())))
    }

    pub fn with_results<I: IntoIterator<Item = Result<String, String>>>(results: I) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Always returns `output`.
    pub fn repeating(output: impl Into<String>) -> Self {
        Self {
            fallback: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<GenerateCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn models(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.model).collect()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, context: &str, iteration: u32, model: &str) -> Result<String> {
        self.calls.lock().expect("calls lock").push(GenerateCall {
            context: context.to_string(),
            iteration,
            model: model.to_string(),
        });
        match self.script.lock().expect("script lock").pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("generator script exhausted")),
        }
    }
}

/// Returns scripted scores in order, then the fallback.
#[derive(Debug, Default)]
pub struct ScriptedScorer {
    script: Mutex<VecDeque<Result<f64, String>>>,
    fallback: Option<f64>,
    calls: Mutex<usize>,
}

impl ScriptedScorer {
    pub fn new<I: IntoIterator<Item = f64>>(scores: I) -> Self {
        Self::with_results(scores.into_iter().map(Ok))
    }

    pub fn with_results<I: IntoIterator<Item = Result<f64, String>>>(results: I) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn repeating(score: f64) -> Self {
        Self {
            fallback: Some(score),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }
}

impl Scorer for ScriptedScorer {
    fn score(&self, _output: &str, _context: &str) -> Result<f64> {
        *self.calls.lock().expect("calls lock") += 1;
        match self.script.lock().expect("script lock").pop_front() {
            Some(Ok(score)) => Ok(score),
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => self
                .fallback
                .ok_or_else(|| anyhow!("scorer script exhausted")),
        }
    }
}

/// Test runner returning scripted exit codes (default: green).
#[derive(Debug, Default)]
pub struct ScriptedTestRunner {
    exits: Mutex<VecDeque<Option<i32>>>,
    calls: Mutex<Vec<PathBuf>>,
}

impl ScriptedTestRunner {
    pub fn green() -> Self {
        Self::default()
    }

    pub fn with_exits<I: IntoIterator<Item = Option<i32>>>(exits: I) -> Self {
        Self {
            exits: Mutex::new(exits.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(request.workdir.clone());
        let exit_code = self
            .exits
            .lock()
            .expect("exits lock")
            .pop_front()
            .unwrap_or(Some(0));
        Ok(TestOutcome {
            exit_code,
            timed_out: false,
            log: format!("scripted exit {exit_code:?}"),
        })
    }
}

/// Records requested sleeps without sleeping.
#[derive(Debug, Default)]
pub struct CountingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl CountingSleeper {
    pub fn count(&self) -> usize {
        self.sleeps.lock().expect("sleeps lock").len()
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.sleeps.lock().expect("sleeps lock").clone()
    }
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().expect("sleeps lock").push(duration);
    }
}
