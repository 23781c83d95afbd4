//! CLI tests: spawn the conductor binary and check its JSON and exit codes.

use std::path::Path;
use std::process::{Command, Output};

use conductor::exit_codes;
use conductor::io::config::{EngineConfig, EnginePaths, write_config};
use conductor::test_support::TestRepo;
use serde_json::Value;

fn conductor(root: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_conductor"));
    cmd.arg("--root")
        .arg(root)
        .args(args)
        .env_remove("AGENT_SANDBOX_ACTIVE")
        .env_remove("AI_TOOLS_EXECUTE")
        .env_remove("DRY_RUN")
        .env_remove("GIT_REMOTE");
    cmd
}

fn json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is json")
}

#[test]
fn route_prints_decision() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = conductor(temp.path(), &["route", "--privacy", "high", "write the PRD"])
        .output()
        .expect("route");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let decision = json(&output);
    assert_eq!(decision["model_id"], "ollama");
    assert_eq!(decision["reason"], "privacy_high");
    assert_eq!(decision["max_loops"], 0);
}

#[test]
fn shell_blocks_unlisted_command() {
    let repo = TestRepo::new().expect("repo");
    let output = conductor(repo.path(), &["shell", "--correlation-id", "c-1", "echo hi"])
        .output()
        .expect("shell");

    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    let result = json(&output);
    assert_eq!(result["action"], "blocked");
    assert_eq!(result["reason"], "not_allowlisted");
}

#[test]
fn shell_refuses_to_nest_inside_a_sandbox() {
    let repo = TestRepo::new().expect("repo");
    let output = conductor(repo.path(), &["shell", "--correlation-id", "c-1", "ls"])
        .env("AGENT_SANDBOX_ACTIVE", "1")
        .output()
        .expect("shell");

    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert!(output.stdout.is_empty());
}

#[test]
fn shell_executes_when_enabled() {
    let repo = TestRepo::new().expect("repo");
    let output = conductor(repo.path(), &["shell", "--correlation-id", "c-2", "ls"])
        .env("AI_TOOLS_EXECUTE", "1")
        .output()
        .expect("shell");

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let result = json(&output);
    assert_eq!(result["action"], "executed");
    assert_eq!(result["status"], "ok");
    assert!(result["stdout"].as_str().expect("stdout").contains("README.md"));
}

#[test]
fn wrap_reports_failing_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = conductor(temp.path(), &["wrap", "--", "sh", "-c", "echo out; exit 4"])
        .output()
        .expect("wrap");

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let report = json(&output);
    assert_eq!(report["status"], "failed");
    assert_eq!(report["stdout"], "out\n");
    assert_eq!(report["exit_code"], 4);
}

#[test]
fn backlog_push_then_list() {
    let temp = tempfile::tempdir().expect("tempdir");
    let pushed = conductor(temp.path(), &["backlog", "push", "--task-id", "t-1", "--summary", "first"])
        .output()
        .expect("push");
    assert_eq!(pushed.status.code(), Some(exit_codes::OK));

    let listed = conductor(temp.path(), &["backlog", "list"]).output().expect("list");
    let entries = json(&listed);
    let entries = entries.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["task_id"], "t-1");
    assert_eq!(entries[0]["status"], "queued");
}

#[test]
fn handshake_commits_once_and_records_backlog() {
    let repo = TestRepo::new().expect("repo");
    let paths = EnginePaths::new(repo.path());
    let mut config = EngineConfig::default();
    config.handshake.test_command = vec!["true".to_string()];
    write_config(&paths.config_path, &config).expect("config");
    repo.run_git(&["add", "."]).expect("add");
    repo.run_git(&["commit", "-m", "configure conductor"]).expect("commit");

    let artifact = repo.scratch().join("prd.md");
    std::fs::write(&artifact, "# CLI PRD\n").expect("artifact");
    let args = [
        "handshake",
        "--task-id",
        "t-9",
        "--summary",
        "cli PRD",
        "--artifact-file",
        artifact.to_str().expect("utf8"),
        "--idempotency-uuid",
        "uuid-cli",
        "--dry-run",
    ];

    let first = conductor(repo.path(), &args).output().expect("first");
    assert_eq!(first.status.code(), Some(exit_codes::OK), "{first:?}");
    let committed = json(&first);
    assert_eq!(committed["status"], "committed");
    assert_eq!(committed["pushed"], false);

    let second = conductor(repo.path(), &args).output().expect("second");
    assert_eq!(second.status.code(), Some(exit_codes::OK));
    let skipped = json(&second);
    assert_eq!(skipped["status"], "skipped");
    assert_eq!(skipped["commit_hash"], committed["commit_hash"]);

    assert_eq!(repo.read("artifacts/t-9.md").expect("read"), "# CLI PRD\n");
    assert!(repo.git().is_clean().expect("clean"));
    let listed = conductor(repo.path(), &["backlog", "list"]).output().expect("list");
    let entries = json(&listed);
    assert_eq!(entries.as_array().expect("array").len(), 1);
    assert_eq!(entries[0]["status"], "skipped");
    assert_eq!(entries[0]["commit_hash"], committed["commit_hash"]);
}

#[test]
fn commit_runs_tests_then_commits_with_task_prefix() {
    let repo = TestRepo::new().expect("repo");
    let paths = EnginePaths::new(repo.path());
    let mut config = EngineConfig::default();
    config.handshake.test_command = vec!["true".to_string()];
    config.sandbox.worktrees_dir = Some(repo.scratch().join("worktrees"));
    write_config(&paths.config_path, &config).expect("config");
    repo.run_git(&["add", "."]).expect("add");
    repo.run_git(&["commit", "-m", "configure conductor"]).expect("commit");

    let created = conductor(
        repo.path(),
        &["sandbox", "create", "--correlation-id", "c-7", "--branch", "feat-7"],
    )
    .output()
    .expect("create");
    assert_eq!(created.status.code(), Some(exit_codes::OK), "{created:?}");
    let worktree = json(&created);
    let repo_dir = Path::new(worktree["repo_dir"].as_str().expect("repo_dir"));
    std::fs::write(repo_dir.join("plan.md"), "# plan\n").expect("plan");

    let output = conductor(
        repo.path(),
        &["commit", "--correlation-id", "c-7", "--task-id", "t-7", "-m", "add plan"],
    )
    .env("AI_TOOLS_EXECUTE", "1")
    .output()
    .expect("commit");

    assert_eq!(output.status.code(), Some(exit_codes::OK), "{output:?}");
    let result = json(&output);
    assert_eq!(result["tests"]["status"], "ok");
    assert_eq!(result["commit"]["action"], "committed");
    assert_eq!(result["commit"]["branch"], "feat-7");
    let subject = repo
        .run_git(&["log", "-1", "--format=%s", "feat-7"])
        .expect("log");
    assert_eq!(subject.trim(), "t-7: add plan");
}
