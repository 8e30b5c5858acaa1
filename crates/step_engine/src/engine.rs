use std::future::Future;

use thiserror::Error;
use tokio::time::sleep;

use piprov_command_runner::{CommandRunner, RunLog};
use piprov_state_store::{StateError, StateStore, StepStatus};

use crate::cleanup::CleanupRegistry;
use crate::plan::{plan_steps, EngineOptions, PlannedAction};
use crate::step::{CleanupAction, Detection, Step, StepContext, StepError, Verification};
use crate::ui::EngineUI;

const DONE_EARLIER: &str = "completed in a previous run";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step {step} failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("step {step} did not verify: {reason}")]
    VerificationFailed { step: String, reason: String },

    #[error("interrupted during step {step}")]
    Interrupted { step: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl EngineError {
    /// Step the run stopped at, if it stopped at one.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineError::StepFailed { step, .. }
            | EngineError::VerificationFailed { step, .. }
            | EngineError::Interrupted { step } => Some(step),
            EngineError::UnknownStep(_) | EngineError::State(_) => None,
        }
    }

    pub fn diagnostic(&self) -> Option<String> {
        match self {
            EngineError::StepFailed { source, .. } => source.diagnostic(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub id: String,
    pub status: StepStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<StepOutcome>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.count(StepStatus::Completed)
    }

    pub fn skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

enum Finished {
    Skipped(String),
    Completed(String),
}

enum Raced {
    Done(Result<Finished, EngineError>),
    Cancelled,
}

/// Runs steps in order against the state store.
pub struct StepEngine<'a> {
    runner: &'a dyn CommandRunner,
    store: &'a mut StateStore,
    options: EngineOptions,
    log: Option<RunLog>,
}

impl<'a> StepEngine<'a> {
    pub fn new(runner: &'a dyn CommandRunner, store: &'a mut StateStore, options: EngineOptions) -> Self {
        Self {
            runner,
            store,
            options,
            log: None,
        }
    }

    /// Masks every sensitive state value, including those steps produce,
    /// in this log and in failure details.
    pub fn with_log(mut self, log: Option<RunLog>) -> Self {
        self.log = log;
        self
    }

    fn register_secrets(&self) {
        let Some(log) = &self.log else {
            return;
        };
        for value in self.store.state().config.values().filter(|v| v.sensitive) {
            log.redact(&value.value);
        }
    }

    fn masked(&self, text: &str) -> String {
        match &self.log {
            Some(log) => log.redacted(text),
            None => text.to_string(),
        }
    }

    /// Runs `steps`, racing each one against `cancel`.
    ///
    /// On failure the failing step's own cleanup actions are undone and the
    /// run halts. When `cancel` resolves, every cleanup action registered in
    /// this run is undone and the owning steps are reset to pending.
    pub async fn run<UI, C>(
        &mut self,
        steps: &[Box<dyn Step>],
        ui: &mut UI,
        cancel: C,
    ) -> Result<RunReport, EngineError>
    where
        UI: EngineUI + Send,
        C: Future<Output = ()>,
    {
        let ids: Vec<&str> = steps.iter().map(|s| s.id()).collect();
        let plan = plan_steps(&ids, self.store.state(), &self.options)?;
        let total = steps.len();

        self.register_secrets();
        ui.on_start(total);
        let mut report = RunReport::default();
        let mut registry = CleanupRegistry::new();
        tokio::pin!(cancel);

        for (index, (step, planned)) in steps.iter().zip(plan).enumerate() {
            let id = step.id().to_string();

            let forced = match planned.action {
                PlannedAction::AlreadyDone(_) => {
                    self.store
                        .record_step_result(&id, StepStatus::Skipped, Some(DONE_EARLIER.to_string()))?;
                    ui.on_step_skipped(&id, DONE_EARLIER);
                    report.outcomes.push(StepOutcome {
                        id,
                        status: StepStatus::Skipped,
                        detail: DONE_EARLIER.to_string(),
                    });
                    continue;
                }
                PlannedAction::Run { forced } => forced,
            };

            ui.on_step_start(index, total, &id, step.description());
            self.store.record_step_start(&id)?;
            tracing::info!(step = %id, forced, "step started");

            let mut actions: Vec<CleanupAction> = Vec::new();
            let raced = {
                let execution = execute_step(
                    self.runner,
                    &mut *self.store,
                    &self.options,
                    self.log.as_ref(),
                    step.as_ref(),
                    forced,
                    &mut actions,
                    &mut *ui,
                );
                tokio::select! {
                    biased;
                    _ = &mut cancel => Raced::Cancelled,
                    result = execution => Raced::Done(result),
                }
            };

            match raced {
                Raced::Done(Ok(Finished::Skipped(detail))) => {
                    self.store
                        .record_step_result(&id, StepStatus::Skipped, Some(detail.clone()))?;
                    ui.on_step_skipped(&id, &detail);
                    registry.extend(&id, actions);
                    report.outcomes.push(StepOutcome {
                        id,
                        status: StepStatus::Skipped,
                        detail,
                    });
                }
                Raced::Done(Ok(Finished::Completed(detail))) => {
                    self.store
                        .record_step_result(&id, StepStatus::Completed, Some(detail.clone()))?;
                    ui.on_step_completed(&id, &detail);
                    registry.extend(&id, actions);
                    report.outcomes.push(StepOutcome {
                        id,
                        status: StepStatus::Completed,
                        detail,
                    });
                }
                Raced::Done(Err(err)) => {
                    let message = self.masked(&err.to_string());
                    let diagnostic = err.diagnostic().map(|tail| self.masked(&tail));
                    let detail = match &diagnostic {
                        Some(tail) => format!("{message}\n{tail}"),
                        None => message.clone(),
                    };
                    self.store
                        .record_step_result(&id, StepStatus::Failed, Some(detail))?;
                    ui.on_step_failed(&id, &message, diagnostic.as_deref());
                    tracing::error!(step = %id, "step failed: {err}");

                    let mut own = CleanupRegistry::new();
                    own.extend(&id, actions);
                    own.rollback(self.runner, ui).await;
                    return Err(err);
                }
                Raced::Cancelled => {
                    ui.on_interrupted(&id);
                    tracing::warn!(step = %id, "interrupted");

                    registry.extend(&id, actions);
                    let touched = registry.step_ids();
                    registry.rollback(self.runner, ui).await;

                    self.store.record_step_result(
                        &id,
                        StepStatus::Pending,
                        Some("interrupted".to_string()),
                    )?;
                    for step_id in touched.iter().filter(|s| **s != id) {
                        self.store.record_step_result(
                            step_id,
                            StepStatus::Pending,
                            Some("rolled back after interrupt".to_string()),
                        )?;
                    }
                    return Err(EngineError::Interrupted { step: id });
                }
            }
        }

        ui.on_complete(&report);
        Ok(report)
    }
}

async fn execute_step<UI: EngineUI + Send + ?Sized>(
    runner: &dyn CommandRunner,
    store: &mut StateStore,
    options: &EngineOptions,
    log: Option<&RunLog>,
    step: &dyn Step,
    forced: bool,
    actions: &mut Vec<CleanupAction>,
    ui: &mut UI,
) -> Result<Finished, EngineError> {
    let id = step.id();
    let failed = |source: StepError| EngineError::StepFailed {
        step: id.to_string(),
        source,
    };

    let mut ctx = StepContext::new(runner, store, actions).with_log(log.cloned());

    let mut repaired = None;
    if !forced {
        match step.detect(&mut ctx).await.map_err(failed)? {
            Detection::Satisfied(detail) => return Ok(Finished::Skipped(detail)),
            Detection::Missing => {}
            Detection::Drifted(reason) => {
                ui.on_step_drifted(id, &reason);
                repaired = Some(reason);
            }
        }
    }

    let max_attempts = if step.network_bound() {
        options.network_attempts.max(1)
    } else {
        1
    };
    for attempt in 1..=max_attempts {
        ctx.attempt = attempt;
        match step.apply(&mut ctx).await {
            Ok(()) => break,
            Err(e) if attempt < max_attempts && e.is_retryable() => {
                ui.on_retry(id, attempt, max_attempts, &e.to_string());
                tracing::warn!(step = %id, attempt, max_attempts, "apply failed, retrying: {e}");
                sleep(options.retry_delay).await;
            }
            Err(e) => return Err(failed(e)),
        }
    }

    match step.verify(&mut ctx).await.map_err(failed)? {
        Verification::Passed => {}
        Verification::Failed(reason) => {
            return Err(EngineError::VerificationFailed {
                step: id.to_string(),
                reason,
            })
        }
    }

    let mut notes = ctx.take_notes();
    if let Some(reason) = repaired {
        notes.insert(0, format!("repaired ({reason})"));
    }
    let detail = if notes.is_empty() {
        "installed".to_string()
    } else {
        notes.join("; ")
    };
    Ok(Finished::Completed(detail))
}
