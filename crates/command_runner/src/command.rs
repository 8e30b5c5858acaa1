use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for commands (5 minutes)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Replacement for redacted values in command lines and logs.
pub const REDACTED: &str = "********";

/// Delay policy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(Duration::from_secs(2))
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Additional attempts after the first failure.
    pub retries: u32,
    pub backoff: Backoff,
    pub acceptable_exit_codes: Vec<i32>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            backoff: Backoff::default(),
            acceptable_exit_codes: vec![0],
            cwd: None,
            env: Vec::new(),
            stdin: None,
        }
    }
}

/// A command to be executed
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub options: RunOptions,
    pub name: Option<String>,
    redactions: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            options: RunOptions::default(),
            name: None,
            redactions: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32, backoff: Backoff) -> Self {
        self.options.retries = retries;
        self.options.backoff = backoff;
        self
    }

    pub fn accept_exit_codes(mut self, codes: &[i32]) -> Self {
        self.options.acceptable_exit_codes = codes.to_vec();
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.options.stdin = Some(input.into());
        self
    }

    /// Masks `secret` wherever this command is displayed or logged.
    pub fn redact(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.redactions.push(secret);
        }
        self
    }

    pub fn accepts(&self, exit_code: i32) -> bool {
        self.options.acceptable_exit_codes.contains(&exit_code)
    }

    /// Full command line with redactions applied.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push_str(&format!("'{arg}'"));
            } else {
                line.push_str(arg);
            }
        }
        self.redacted(&line)
    }

    /// Get the display name for this command
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => {
                let line = self.command_line();
                if line.chars().count() > 80 {
                    let short: String = line.chars().take(77).collect();
                    format!("{short}...")
                } else {
                    line
                }
            }
        }
    }

    pub fn redacted(&self, text: &str) -> String {
        self.redactions
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// `output` with redactions applied to stdout and stderr.
    pub fn redacted_output(&self, output: ProcessOutput) -> ProcessOutput {
        if self.redactions.is_empty() {
            return output;
        }
        ProcessOutput {
            stdout: self.redacted(&output.stdout),
            stderr: self.redacted(&output.stderr),
            ..output
        }
    }
}

/// Result of command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Last `lines` non-empty lines of stderr, or of stdout when stderr is empty.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let kept: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}
