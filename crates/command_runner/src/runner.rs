use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::sleep;

use crate::command::{Backoff, CommandSpec, ProcessOutput, DEFAULT_TIMEOUT};
use crate::run_log::RunLog;
use crate::RunnerError;

/// Executes external commands.
///
/// The real implementation is [`SystemRunner`]; tests use
/// `test_utils::MockRunner`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the command, retrying per its options. Exit codes outside
    /// `acceptable_exit_codes` are returned as [`RunnerError::Failed`].
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError>;

    /// Whether `program` resolves on PATH (or exists, for absolute paths).
    fn exists(&self, program: &str) -> bool;
}

/// Timeout and retries for commands that do not choose their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Backoff,
}

/// Runs commands as child processes of this process.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner {
    log: Option<RunLog>,
    policy: Option<RunPolicy>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: RunLog) -> Self {
        Self {
            log: Some(log),
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// `spec` with the policy filled in where it kept the defaults.
    fn effective(&self, spec: &CommandSpec) -> CommandSpec {
        let mut spec = spec.clone();
        if let Some(policy) = &self.policy {
            if spec.options.timeout == DEFAULT_TIMEOUT {
                spec.options.timeout = policy.timeout;
            }
            if spec.options.retries == 0 {
                spec.options.retries = policy.retries;
                spec.options.backoff = policy.backoff;
            }
        }
        spec
    }

    fn record(&self, category: &str, message: &str) {
        if let Some(log) = &self.log {
            log.record(category, message);
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError> {
        let spec = &self.effective(spec);
        let program = match resolve_program(&spec.program, spec.options.cwd.as_deref()) {
            Ok(path) => path,
            Err(err) => {
                self.record("exec", &format!("{}: {err}", spec.command_line()));
                return Err(err);
            }
        };

        let max_attempts = spec.options.retries + 1;
        let mut attempt = 1;

        loop {
            self.record(
                "exec",
                &format!("{} (attempt {attempt}/{max_attempts})", spec.command_line()),
            );
            tracing::debug!(command = %spec.command_line(), attempt, "running command");

            let result = run_once(&program, spec).await.and_then(|output| {
                if spec.accepts(output.exit_code) {
                    Ok(output)
                } else {
                    // Failures travel to the terminal and the state file.
                    Err(RunnerError::Failed {
                        command: spec.display_name(),
                        output: spec.redacted_output(output),
                    })
                }
            });

            match &result {
                Ok(output) => self.record(
                    "exec",
                    &format!(
                        "exit {} after {:.1}s",
                        output.exit_code,
                        output.duration.as_secs_f64()
                    ),
                ),
                Err(err) => {
                    self.record("exec", &spec.redacted(&err.to_string()));
                    if let Some(tail) = err.diagnostic(20) {
                        self.record("stderr", &tail);
                    }
                }
            }

            match result {
                Err(err) if attempt < max_attempts && err.is_retryable() => {
                    let delay = spec.options.backoff.delay(attempt);
                    tracing::warn!(
                        command = %spec.display_name(),
                        "attempt {attempt}/{max_attempts} failed, retrying in {:.1}s: {err}",
                        delay.as_secs_f64()
                    );
                    self.record(
                        "retry",
                        &format!(
                            "{} failed on attempt {attempt}/{max_attempts}, retrying in {:.1}s",
                            spec.display_name(),
                            delay.as_secs_f64()
                        ),
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn exists(&self, program: &str) -> bool {
        resolve_program(program, None).is_ok()
    }
}

/// Relative paths (`./configure`) resolve against the command's `cwd`.
fn resolve_program(program: &str, cwd: Option<&Path>) -> Result<PathBuf, RunnerError> {
    if program.contains('/') {
        let path = match cwd {
            Some(dir) if Path::new(program).is_relative() => dir.join(program),
            _ => PathBuf::from(program),
        };
        if path.is_file() {
            return Ok(path);
        }
        return Err(RunnerError::NotFound(program.to_string()));
    }
    which::which(program).map_err(|_| RunnerError::NotFound(program.to_string()))
}

async fn run_once(program: &Path, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError> {
    let started = Instant::now();
    let io_error = |source| RunnerError::Spawn {
        command: spec.display_name(),
        source,
    };

    let mut cmd = Command::new(program);
    cmd.args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        // Dropping the wait future on timeout kills the child.
        .kill_on_drop(true);
    if let Some(dir) = &spec.options.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.options.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(io_error)?;
    let stdin = child.stdin.take();

    // Feeding stdin counts against the timeout: a child that never reads
    // must not block the run.
    let finished = async move {
        if let (Some(input), Some(mut stdin)) = (&spec.options.stdin, stdin) {
            feed_stdin(&mut stdin, input).await?;
        }
        child.wait_with_output().await
    };

    match tokio::time::timeout(spec.options.timeout, finished).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        }),
        Ok(Err(source)) => Err(io_error(source)),
        Err(_) => Err(RunnerError::Timeout {
            command: spec.display_name(),
            timeout: spec.options.timeout,
        }),
    }
}

/// A child exiting without reading all of its input is not an error.
async fn feed_stdin(stdin: &mut tokio::process::ChildStdin, input: &str) -> std::io::Result<()> {
    let written = match stdin.write_all(input.as_bytes()).await {
        Ok(()) => stdin.shutdown().await,
        Err(e) => Err(e),
    };
    match written {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Turns a failed run into success when `benign` recognizes its output,
/// e.g. an "already exists" message from a create command.
pub fn tolerate<F>(
    result: Result<ProcessOutput, RunnerError>,
    benign: F,
) -> Result<ProcessOutput, RunnerError>
where
    F: Fn(&ProcessOutput) -> bool,
{
    match result {
        Err(RunnerError::Failed { output, .. }) if benign(&output) => Ok(output),
        other => other,
    }
}
