use std::time::Duration;

use thiserror::Error;

pub mod command;
pub mod run_log;
pub mod runner;

pub use command::{Backoff, CommandSpec, ProcessOutput, RunOptions, DEFAULT_TIMEOUT, REDACTED};
pub use run_log::RunLog;
pub use runner::{tolerate, CommandRunner, RunPolicy, SystemRunner};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command not found: {0}")]
    NotFound(String),

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("{command} exited with code {}", .output.exit_code)]
    Failed { command: String, output: ProcessOutput },
}

impl RunnerError {
    /// A missing binary will still be missing on the next attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RunnerError::NotFound(_))
    }

    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            RunnerError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Tail of the failing command's output, if there is any.
    pub fn diagnostic(&self, lines: usize) -> Option<String> {
        self.output()
            .map(|output| output.tail(lines))
            .filter(|tail| !tail.is_empty())
    }
}

// ============================================================================
// Test Utilities - exported for integration tests of dependent crates
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    enum Scripted {
        Output(ProcessOutput),
        Timeout,
    }

    /// Scripted [`CommandRunner`].
    ///
    /// Responses are keyed by a command prefix (`"systemctl is-active"`); the
    /// longest matching prefix wins. Several responses for one prefix are
    /// returned in order, the last one repeats. Unmatched commands succeed
    /// with empty output.
    #[derive(Default)]
    pub struct MockRunner {
        responses: Mutex<Vec<(String, VecDeque<Scripted>)>>,
        missing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, prefix: &str, exit_code: i32, stdout: &str) -> &Self {
            self.on_output(prefix, output(exit_code, stdout, ""))
        }

        pub fn on_output(&self, prefix: &str, output: ProcessOutput) -> &Self {
            self.push(prefix, Scripted::Output(output));
            self
        }

        pub fn on_timeout(&self, prefix: &str) -> &Self {
            self.push(prefix, Scripted::Timeout);
            self
        }

        /// Makes `program` unresolvable.
        pub fn missing(&self, program: &str) -> &Self {
            self.missing.lock().unwrap().insert(program.to_string());
            self
        }

        /// Command lines of every call, in order.
        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|spec| spec.command_line())
                .collect()
        }

        pub fn call_count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        pub fn specs(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, prefix: &str, response: Scripted) {
            let mut responses = self.responses.lock().unwrap();
            if let Some((_, queue)) = responses.iter_mut().find(|(p, _)| p == prefix) {
                queue.push_back(response);
            } else {
                responses.push((prefix.to_string(), VecDeque::from([response])));
            }
        }

        fn next_response(&self, line: &str) -> Option<Scripted> {
            let mut responses = self.responses.lock().unwrap();
            let (_, queue) = responses
                .iter_mut()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError> {
            self.calls.lock().unwrap().push(spec.clone());

            if self.missing.lock().unwrap().contains(&spec.program) {
                return Err(RunnerError::NotFound(spec.program.clone()));
            }

            // Match against the unredacted line so tests can script on secrets.
            let raw = std::iter::once(spec.program.as_str())
                .chain(spec.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");

            match self.next_response(&raw) {
                Some(Scripted::Timeout) => Err(RunnerError::Timeout {
                    command: spec.display_name(),
                    timeout: spec.options.timeout,
                }),
                Some(Scripted::Output(out)) if !spec.accepts(out.exit_code) => {
                    Err(RunnerError::Failed {
                        command: spec.display_name(),
                        output: spec.redacted_output(out),
                    })
                }
                Some(Scripted::Output(out)) => Ok(out),
                None => Ok(output(0, "", "")),
            }
        }

        fn exists(&self, program: &str) -> bool {
            !self.missing.lock().unwrap().contains(program)
        }
    }

    pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!RunnerError::NotFound("nqptp".into()).is_retryable());
        let failed = RunnerError::Failed {
            command: "apt-get update".into(),
            output: output(100, "", "E: Could not get lock\n"),
        };
        assert!(failed.is_retryable());
        assert_eq!(failed.diagnostic(5).as_deref(), Some("E: Could not get lock"));
    }

    #[test]
    fn test_error_messages() {
        let timeout = RunnerError::Timeout {
            command: "make".into(),
            timeout: Duration::from_secs(90),
        };
        assert_eq!(timeout.to_string(), "make timed out after 90s");

        let failed = RunnerError::Failed {
            command: "make".into(),
            output: output(2, "", ""),
        };
        assert_eq!(failed.to_string(), "make exited with code 2");
        assert!(failed.diagnostic(5).is_none());
    }

    #[tokio::test]
    async fn test_mock_runner_longest_prefix_and_sequence() {
        let mock = MockRunner::new();
        mock.on("systemctl", 0, "generic")
            .on("systemctl is-active nqptp", 3, "inactive")
            .on("systemctl is-active nqptp", 0, "active");

        let is_active = CommandSpec::new("systemctl")
            .args(["is-active", "nqptp"])
            .accept_exit_codes(&[0, 3]);

        assert_eq!(mock.run(&is_active).await.unwrap().stdout, "inactive");
        assert_eq!(mock.run(&is_active).await.unwrap().stdout, "active");
        assert_eq!(mock.run(&is_active).await.unwrap().stdout, "active");

        let other = CommandSpec::new("systemctl").arg("daemon-reload");
        assert_eq!(mock.run(&other).await.unwrap().stdout, "generic");
        assert_eq!(mock.call_count("systemctl is-active"), 3);
    }

    #[tokio::test]
    async fn test_mock_runner_failure_and_missing() {
        let mock = MockRunner::new();
        mock.on("apt-get install", 100, "").missing("cloudflared");

        let err = mock
            .run(&CommandSpec::new("apt-get").args(["install", "-y", "git"]))
            .await
            .unwrap_err();
        assert_eq!(err.output().map(|o| o.exit_code), Some(100));

        let err = mock.run(&CommandSpec::new("cloudflared")).await.unwrap_err();
        assert!(matches!(err, RunnerError::NotFound(_)));
        assert!(!mock.exists("cloudflared"));

        let ok = mock.run(&CommandSpec::new("true")).await.unwrap();
        assert!(ok.success());
    }
}
