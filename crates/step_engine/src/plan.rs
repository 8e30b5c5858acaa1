use std::time::Duration;

use piprov_state_store::{InstallationState, StepStatus};

use crate::EngineError;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Steps re-run even if recorded as done; detection is skipped for them.
    pub force_steps: Vec<String>,
    pub network_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            force_steps: Vec::new(),
            network_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Completed or skipped in an earlier run.
    AlreadyDone(StepStatus),
    Run { forced: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub id: String,
    pub action: PlannedAction,
}

/// Decides for each step whether this run executes it.
pub fn plan_steps(
    ids: &[&str],
    state: &InstallationState,
    options: &EngineOptions,
) -> Result<Vec<PlannedStep>, EngineError> {
    if let Some(unknown) = options
        .force_steps
        .iter()
        .find(|forced| !ids.contains(&forced.as_str()))
    {
        return Err(EngineError::UnknownStep(unknown.clone()));
    }

    Ok(ids
        .iter()
        .map(|id| {
            let forced = options.force_steps.iter().any(|f| f == id);
            let status = state.status(id);
            let action = if status.is_done() && !forced {
                PlannedAction::AlreadyDone(status)
            } else {
                PlannedAction::Run { forced }
            };
            PlannedStep {
                id: id.to_string(),
                action,
            }
        })
        .collect())
}
