use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use piprov_command_runner::{CommandRunner, CommandSpec, ProcessOutput, RunLog, RunnerError};
use piprov_state_store::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Command(#[from] RunnerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{service}: {message}")]
    ExternalService { service: String, message: String },

    #[error("missing configuration value '{0}'")]
    MissingConfig(String),

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn external(service: &str, message: impl Into<String>) -> Self {
        StepError::ExternalService {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Whether another attempt of a network-bound step could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Command(e) => e.is_retryable(),
            StepError::ExternalService { .. } | StepError::Io(_) => true,
            StepError::State(_) | StepError::MissingConfig(_) | StepError::Failed(_) => false,
        }
    }

    /// Last lines of the failing command's output.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            StepError::Command(e) => e.diagnostic(10),
            _ => None,
        }
    }
}

/// Result of probing whether a step's goal already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Satisfied(String),
    Missing,
    /// Present but not as desired; applying repairs it.
    Drifted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Passed,
    Failed(String),
}

/// Undo action registered by a step while it mutates the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    StopService(String),
    RestoreFile { original: PathBuf, backup: PathBuf },
    RemoveFile(PathBuf),
    RemoveDir(PathBuf),
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupAction::StopService(unit) => write!(f, "stop service {unit}"),
            CleanupAction::RestoreFile { original, .. } => {
                write!(f, "restore {}", original.display())
            }
            CleanupAction::RemoveFile(path) => write!(f, "remove {}", path.display()),
            CleanupAction::RemoveDir(path) => write!(f, "remove directory {}", path.display()),
        }
    }
}

/// A named, idempotent unit of provisioning work.
#[async_trait]
pub trait Step: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Network-bound steps are retried as a whole by the engine.
    fn network_bound(&self) -> bool {
        false
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError>;

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError>;

    /// Checked independently after `apply`; exit codes alone are not trusted.
    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError>;
}

/// What a step may touch while running.
pub struct StepContext<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a mut StateStore,
    cleanup: &'a mut Vec<CleanupAction>,
    notes: Vec<String>,
    log: Option<RunLog>,
    pub(crate) attempt: u32,
}

impl<'a> StepContext<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        store: &'a mut StateStore,
        cleanup: &'a mut Vec<CleanupAction>,
    ) -> Self {
        Self {
            runner,
            store,
            cleanup,
            notes: Vec::new(),
            log: None,
            attempt: 1,
        }
    }

    /// Sensitive values the step remembers are masked in this log.
    pub fn with_log(mut self, log: Option<RunLog>) -> Self {
        self.log = log;
        self
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner
    }

    pub async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, StepError> {
        Ok(self.runner.run(spec).await?)
    }

    pub fn config(&self, key: &str) -> Option<String> {
        self.store.get(key).map(str::to_string)
    }

    pub fn require_config(&self, key: &str) -> Result<String, StepError> {
        self.config(key)
            .ok_or_else(|| StepError::MissingConfig(key.to_string()))
    }

    /// Persists a value produced by the step (tunnel id, generated secret).
    pub fn remember(&mut self, key: &str, value: &str, sensitive: bool) -> Result<(), StepError> {
        if sensitive {
            if let Some(log) = &self.log {
                log.redact(value);
            }
        }
        self.store.set(key, value, sensitive)?;
        Ok(())
    }

    pub fn on_cleanup(&mut self, action: CleanupAction) {
        self.cleanup.push(action);
    }

    /// Adds a line to the step's recorded detail.
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }
}
