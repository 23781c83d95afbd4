//! Child processes with a hard wall-clock timeout and bounded output.
//!
//! The timeout is enforced from outside the child (`wait-timeout` + kill), so a
//! hung command can never wedge the calling worker.

use std::io::{ErrorKind, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const EXEC_REPORT_SCHEMA: &str = include_str!("../../schemas/exec_report.schema.json");

static EXEC_REPORT_VALIDATOR: LazyLock<Option<Validator>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(EXEC_REPORT_SCHEMA).ok()?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .ok()
});

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Flatten into the structured report shape used by the sandbox.
    pub fn to_report(&self) -> ExecReport {
        let status = if self.timed_out {
            ExecStatus::Timeout
        } else if self.status.success() {
            ExecStatus::Ok
        } else {
            ExecStatus::Failed
        };
        let mut stdout = String::from_utf8_lossy(&self.stdout).to_string();
        if self.stdout_truncated > 0 {
            stdout.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        let mut stderr = String::from_utf8_lossy(&self.stderr).to_string();
        if self.stderr_truncated > 0 {
            stderr.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        ExecReport {
            status,
            stdout,
            stderr,
            exit_code: self.status.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Ok,
    Failed,
    Timeout,
}

/// Structured `{status, stdout, stderr}` result of a sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecReport {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Parse a wrapper's stdout as an `ExecReport`.
///
/// Returns `None` unless the payload is a single JSON object matching the
/// report schema.
pub fn parse_exec_report(raw: &[u8]) -> Option<ExecReport> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    let value: Value = serde_json::from_str(text).ok()?;
    let validator = EXEC_REPORT_VALIDATOR.as_ref()?;
    if !validator.is_valid(&value) {
        debug!("wrapper output does not match exec report schema");
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs and stdin is fed from its own thread, so a
/// child that stops reading cannot block the timeout. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On unix the child leads its own process group and a timeout kills the whole group.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {:?}", cmd.get_program()));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // The pipe closes when the thread drops it, so the child sees EOF.
            Some(thread::spawn(move || match child_stdin.write_all(&input) {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            kill_process_group(child.id());
            if let Err(e) = child.kill() {
                debug!(err = %e, "direct kill after group kill failed");
            }
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if timed_out => debug!(err = %e, "stdin write interrupted by timeout"),
            Ok(Err(e)) => return Err(e).context("write stdin"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// SIGKILL every process in the group led by `pid`.
///
/// Grandchildren inherit the output pipes; killing only the direct child
/// would leave the readers waiting on them.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pid, exit_code = ?status.code(), "process group kill reported failure"),
        Err(e) => warn!(pid, err = %e, "could not run kill for process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let out = run_command_with_timeout(sh("echo hello; exit 3"), None, Duration::from_secs(5), 1024)
            .expect("run");
        assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.to_report().status, ExecStatus::Failed);
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.to_report().status, ExecStatus::Timeout);
    }

    #[test]
    fn timeout_holds_when_child_ignores_large_stdin() {
        let input = vec![b'x'; 512 * 1024];
        let started = Instant::now();
        let out = run_command_with_timeout(sh("sleep 5"), Some(&input), Duration::from_secs(1), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn timeout_reaps_grandchildren_holding_pipes() {
        let started = Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 5 & sleep 5; wait"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn large_stdin_round_trips_through_cat() {
        let input = vec![b'y'; 256 * 1024];
        let out = run_command_with_timeout(
            Command::new("cat"),
            Some(&input),
            Duration::from_secs(5),
            input.len(),
        )
        .expect("run");
        assert_eq!(out.stdout.len(), input.len());
        assert_eq!(out.stdout_truncated, 0);
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let out = run_command_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.to_report().stdout.contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(
            Command::new("cat"),
            Some(b"piped"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(out.stdout, b"piped");
    }

    #[test]
    fn parses_well_formed_report() {
        let raw = br#"{"status":"ok","stdout":"hi\n","stderr":"","exit_code":0}"#;
        let report = parse_exec_report(raw).expect("report");
        assert_eq!(report.status, ExecStatus::Ok);
        assert_eq!(report.stdout, "hi\n");
    }

    #[test]
    fn rejects_malformed_report() {
        assert!(parse_exec_report(b"plain text").is_none());
        assert!(parse_exec_report(br#"{"status":"weird","stdout":"","stderr":""}"#).is_none());
        assert!(parse_exec_report(br#"{"stdout":""}"#).is_none());
    }
}
