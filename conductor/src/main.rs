//! Command-line front end for the conductor engine.
//!
//! Every command prints a JSON result on stdout and exits with one of the
//! codes in [`conductor::exit_codes`]. Diagnostics go to stderr via `RUST_LOG`.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use conductor::agents::StageRegistry;
use conductor::agents::llm::LlmStages;
use conductor::conductor::{ConductorOutcome, ConductorPipeline, ConductorRequest};
use conductor::core::command_policy::split_command;
use conductor::core::pruning::{KeywordRelevance, PruneInput, PruneOptions, PruneStatus, prune_context};
use conductor::core::routing::{CostTier, PrivacyLevel, RouteRequest, route};
use conductor::core::types::RunContext;
use conductor::core::violations::GuardrailViolation;
use conductor::exit_codes;
use conductor::handshake::{HandshakeOutcome, HandshakeRequest, QueueHandshake};
use conductor::io::backlog::{Backlog, BacklogStatus};
use conductor::io::config::{EngineConfig, EnginePaths, Toggles, load_config};
use conductor::io::generator::{CommandGenerator, CommandScorer, CommandSpec};
use conductor::io::git::Git;
use conductor::io::process::{ExecStatus, run_command_with_timeout};
use conductor::io::resume::ResumeStore;
use conductor::io::sandbox::SandboxRunner;
use conductor::io::test_runner::CommandTestRunner;
use conductor::iterate::{AdaptiveRequest, IterateRequest, IterationEngine, IterationOutcome};
use conductor::logging;
use conductor::tools::commit::CommitTool;
use conductor::tools::run_tests::RunTestsTool;
use conductor::tools::safe_shell::SafeShellTool;
use conductor::tools::{ToolGuardrail, ToolResult};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Bounded, idempotent orchestration for LLM-backed agent tasks"
)]
struct Cli {
    /// Repository root holding `.conductor/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pick a model for a task and print the routing decision.
    Route {
        text: String,
        #[arg(long)]
        research: bool,
        #[arg(long)]
        live_data: bool,
        #[arg(long, default_value = "normal")]
        privacy: PrivacyLevel,
        #[arg(long, default_value = "standard")]
        max_cost: CostTier,
    },
    /// Trim context read from a file (or stdin) to the token budget.
    Prune {
        #[arg(long)]
        file: Option<PathBuf>,
        /// Keywords used to rank chunk relevance.
        #[arg(long, default_value = "")]
        query: String,
        #[arg(long)]
        target_tokens: Option<usize>,
    },
    /// Commit an artifact idempotently, run tests, and push.
    Handshake(HandshakeArgs),
    /// Manage per-run sandbox worktrees.
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommand,
    },
    /// Run one command through the tool guardrail.
    Shell {
        #[arg(long)]
        correlation_id: String,
        #[arg(long)]
        branch: Option<String>,
        command: String,
    },
    /// Run the test command in the run's worktree and commit when green.
    Commit(CommitArgs),
    /// Inspect or append to the task backlog.
    Backlog {
        #[command(subcommand)]
        command: BacklogCommand,
    },
    /// Run a command and print its `{status, stdout, stderr}` report.
    Wrap {
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Generate, score, and escalate until the output is good enough.
    Iterate(IterateArgs),
    /// Run the outline/refine/review pipeline.
    Conduct(ConductArgs),
}

#[derive(Args)]
struct HandshakeArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    summary: String,
    /// Artifact file; stdin when omitted.
    #[arg(long)]
    artifact_file: Option<PathBuf>,
    /// Repo-relative path to write the artifact to.
    #[arg(long)]
    path: Option<PathBuf>,
    #[arg(long, default_value = "main")]
    branch: String,
    #[arg(long)]
    correlation_id: Option<String>,
    #[arg(long)]
    idempotency_uuid: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct CommitArgs {
    #[arg(long)]
    correlation_id: String,
    /// Prefixed to the commit subject.
    #[arg(long)]
    task_id: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long, short)]
    message: String,
}

#[derive(Subcommand)]
enum SandboxCommand {
    Create {
        #[arg(long)]
        correlation_id: String,
        #[arg(long)]
        branch: String,
    },
    Cleanup {
        #[arg(long)]
        correlation_id: String,
    },
}

#[derive(Subcommand)]
enum BacklogCommand {
    Push {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        summary: String,
    },
    List,
}

#[derive(Args)]
struct ModelCommands {
    /// Generator command line; receives the prompt on stdin.
    #[arg(long)]
    generator: String,
    /// Scorer command line; prints a 0-100 score.
    #[arg(long)]
    scorer: String,
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[derive(Args)]
struct IterateArgs {
    task: String,
    #[command(flatten)]
    models: ModelCommands,
    /// Walk the escalation chain instead of the fixed loop.
    #[arg(long)]
    adaptive: bool,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    correlation_id: Option<String>,
    #[arg(long)]
    resume: Option<String>,
    #[arg(long)]
    feedback: Option<String>,
    #[arg(long)]
    pause: bool,
}

#[derive(Args)]
struct ConductArgs {
    task: String,
    #[command(flatten)]
    models: ModelCommands,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    correlation_id: Option<String>,
    /// Reused by a later `handshake` so repeated runs commit once.
    #[arg(long)]
    idempotency_uuid: Option<String>,
    #[arg(long)]
    refiners: Option<u32>,
    #[arg(long)]
    max_jobs: Option<u32>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<GuardrailViolation>().is_some() {
                exit_codes::BLOCKED
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = EnginePaths::new(&cli.root);
    let toggles = Toggles::from_env();
    let config = || load_config(&paths.config_path);
    match cli.command {
        Command::Route {
            text,
            research,
            live_data,
            privacy,
            max_cost,
        } => {
            let request = RouteRequest {
                research_requested: research,
                requires_live_data: live_data,
                privacy_level: privacy,
                max_cost_tier: max_cost,
                ..RouteRequest::for_text(text)
            };
            print_json(&route(&request, &config()?.routing))?;
            Ok(exit_codes::OK)
        }
        Command::Prune {
            file,
            query,
            target_tokens,
        } => cmd_prune(&config()?, file.as_deref(), &query, target_tokens),
        Command::Handshake(args) => cmd_handshake(&paths, &config()?, toggles, args),
        Command::Sandbox { command } => cmd_sandbox(&paths, &config()?, command),
        Command::Shell {
            correlation_id,
            branch,
            command,
        } => cmd_shell(&paths, &config()?, toggles, &correlation_id, branch, &command),
        Command::Commit(args) => cmd_commit(&paths, &config()?, toggles, args),
        Command::Backlog { command } => cmd_backlog(&paths, command),
        Command::Wrap { timeout_secs, argv } => cmd_wrap(&argv, timeout_secs),
        Command::Iterate(args) => cmd_iterate(&paths, config()?, toggles, args),
        Command::Conduct(args) => cmd_conduct(config()?, toggles, args),
    }
}

fn cmd_prune(
    config: &EngineConfig,
    file: Option<&Path>,
    query: &str,
    target_tokens: Option<usize>,
) -> Result<i32> {
    let text = read_input(file)?;
    let mut options = PruneOptions::from_config(&config.pruning, Utc::now().date_naive());
    if let Some(target) = target_tokens {
        options.target_tokens = target;
    }
    let outcome = prune_context(
        &PruneInput::Text(text),
        &options,
        &KeywordRelevance::new(query),
    );
    print_json(&outcome)?;
    Ok(match outcome.status {
        PruneStatus::Error => exit_codes::FAILED,
        _ => exit_codes::OK,
    })
}

fn cmd_handshake(
    paths: &EnginePaths,
    config: &EngineConfig,
    toggles: Toggles,
    args: HandshakeArgs,
) -> Result<i32> {
    paths.ensure_state_dirs()?;
    let artifact = read_input(args.artifact_file.as_deref())?;
    let request = HandshakeRequest {
        branch: args.branch,
        correlation_id: args.correlation_id,
        idempotency_uuid: args.idempotency_uuid,
        artifact_path: args.path,
        dry_run: args.dry_run,
        ..HandshakeRequest::new(artifact, args.summary.clone(), args.task_id.clone())
    };
    let tests = CommandTestRunner::new(config.handshake.test_command.clone())?;
    let handshake =
        QueueHandshake::new(Git::new(&paths.root), config.handshake.clone(), tests).with_toggles(toggles);
    let outcome = handshake.queue_handshake(&request)?;

    let status = match outcome {
        HandshakeOutcome::Committed { .. } => BacklogStatus::Committed,
        HandshakeOutcome::Skipped { .. } => BacklogStatus::Skipped,
        HandshakeOutcome::Error { .. } => BacklogStatus::Failed,
    };
    Backlog::new(&paths.backlog_path).record(
        &args.task_id,
        &args.summary,
        status,
        outcome.commit_hash(),
    )?;

    print_json(&outcome)?;
    Ok(match outcome {
        HandshakeOutcome::Error { .. } => exit_codes::FAILED,
        _ => exit_codes::OK,
    })
}

fn cmd_sandbox(paths: &EnginePaths, config: &EngineConfig, command: SandboxCommand) -> Result<i32> {
    let sandbox = SandboxRunner::new(&paths.root, &config.sandbox);
    match command {
        SandboxCommand::Create {
            correlation_id,
            branch,
        } => print_json(&sandbox.worktree(&correlation_id, &branch)?)?,
        SandboxCommand::Cleanup { correlation_id } => {
            let removed = sandbox.cleanup(&correlation_id)?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_shell(
    paths: &EnginePaths,
    config: &EngineConfig,
    toggles: Toggles,
    correlation_id: &str,
    branch: Option<String>,
    command: &str,
) -> Result<i32> {
    let guardrail = ToolGuardrail::new(&config.tools, toggles)?;
    let sandbox = SandboxRunner::new(&paths.root, &config.sandbox);
    let mut ctx = RunContext::new(correlation_id, config.routing.local_model.clone()).with_branch(branch);

    let result = SafeShellTool::new(&guardrail, &sandbox).run(&mut ctx, command)?;
    print_json(&result)?;
    Ok(match &result {
        ToolResult::Blocked { .. } => exit_codes::BLOCKED,
        ToolResult::Executed { report, .. } if report.status != ExecStatus::Ok => exit_codes::FAILED,
        _ => exit_codes::OK,
    })
}

#[derive(Serialize)]
struct CommitReport {
    tests: ToolResult,
    commit: Option<ToolResult>,
}

fn cmd_commit(paths: &EnginePaths, config: &EngineConfig, toggles: Toggles, args: CommitArgs) -> Result<i32> {
    let guardrail = ToolGuardrail::new(&config.tools, toggles)?;
    let sandbox = SandboxRunner::new(&paths.root, &config.sandbox);
    let mut ctx = RunContext::new(args.correlation_id, config.routing.local_model.clone()).with_branch(args.branch);
    if let Some(task_id) = args.task_id {
        ctx = ctx.with_task_id(task_id);
    }

    let tests = RunTestsTool::new(&guardrail, &sandbox, config.handshake.test_command.clone())?.run(&mut ctx)?;
    if !ctx.ledger.tests_green() {
        let code = match tests {
            ToolResult::DryRun { .. } => exit_codes::OK,
            _ => exit_codes::FAILED,
        };
        print_json(&CommitReport { tests, commit: None })?;
        return Ok(code);
    }
    let commit = CommitTool::new(&guardrail, &sandbox).run(&mut ctx, &args.message)?;
    print_json(&CommitReport {
        tests,
        commit: Some(commit),
    })?;
    Ok(exit_codes::OK)
}

fn cmd_backlog(paths: &EnginePaths, command: BacklogCommand) -> Result<i32> {
    let backlog = Backlog::new(&paths.backlog_path);
    match command {
        BacklogCommand::Push { task_id, summary } => {
            paths.ensure_state_dirs()?;
            print_json(&backlog.push(&task_id, &summary)?)?;
        }
        BacklogCommand::List => print_json(&backlog.list()?)?,
    }
    Ok(exit_codes::OK)
}

fn cmd_wrap(argv: &[String], timeout_secs: u64) -> Result<i32> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| anyhow!("wrap requires a command"))?;
    let mut cmd = ProcessCommand::new(program);
    cmd.args(rest);
    let output = run_command_with_timeout(cmd, None, Duration::from_secs(timeout_secs), 100_000)
        .with_context(|| format!("run {program}"))?;
    let report = output.to_report();
    print_json(&report)?;
    Ok(match report.status {
        ExecStatus::Ok => exit_codes::OK,
        _ => exit_codes::FAILED,
    })
}

fn cmd_iterate(paths: &EnginePaths, config: EngineConfig, toggles: Toggles, args: IterateArgs) -> Result<i32> {
    paths.ensure_state_dirs()?;
    let (generator, scorer) = model_backends(&args.models, &config)?;
    let engine = IterationEngine::new(generator, scorer, config, ResumeStore::new(&paths.resume_dir))
        .with_toggles(toggles);

    let outcome = if args.adaptive {
        engine.adaptive_iterate(&AdaptiveRequest {
            branch: args.branch,
            correlation_id: args.correlation_id,
            resume_token: args.resume,
            human_feedback: args.feedback,
            pause: args.pause,
            ..AdaptiveRequest::new(args.task)
        })
    } else {
        engine.iterate_prompt(&IterateRequest {
            branch: args.branch,
            correlation_id: args.correlation_id,
            resume_token: args.resume,
            human_feedback: args.feedback,
            pause: args.pause,
            ..IterateRequest::new(args.task)
        })
    };
    print_json(&outcome)?;
    Ok(match outcome {
        IterationOutcome::Completed { .. } | IterationOutcome::Paused { .. } => exit_codes::OK,
        _ => exit_codes::FAILED,
    })
}

fn cmd_conduct(config: EngineConfig, toggles: Toggles, args: ConductArgs) -> Result<i32> {
    let (generator, scorer) = model_backends(&args.models, &config)?;
    let stages = LlmStages::new(generator, scorer)?;
    let pipeline = ConductorPipeline::new(StageRegistry::uniform(&stages), config).with_toggles(toggles);

    let outcome = pipeline.conductor(&ConductorRequest {
        branch: args.branch,
        correlation_id: args.correlation_id,
        idempotency_uuid: args.idempotency_uuid,
        refiner_iterations: args.refiners,
        max_jobs: args.max_jobs,
        ..ConductorRequest::new(args.task)
    });
    print_json(&outcome)?;
    Ok(match outcome {
        ConductorOutcome::Completed { .. } => exit_codes::OK,
        ConductorOutcome::Aborted { .. } => exit_codes::BLOCKED,
        _ => exit_codes::FAILED,
    })
}

fn model_backends(models: &ModelCommands, config: &EngineConfig) -> Result<(CommandGenerator, CommandScorer)> {
    let timeout = Duration::from_secs(models.timeout_secs);
    let limit = config.sandbox.output_limit_bytes;
    let spec = |line: &str| -> Result<CommandSpec> {
        CommandSpec::new(split_command(line)?, timeout, limit)
    };
    Ok((
        CommandGenerator::new(spec(&models.generator).context("generator command")?),
        CommandScorer::new(spec(&models.scorer).context("scorer command")?),
    ))
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display())),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    std::io::stdout()
        .write_all(payload.as_bytes())
        .context("write stdout")?;
    Ok(())
}
