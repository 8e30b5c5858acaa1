use std::fmt;
use std::time::Duration;

use piprov_command_runner::{CommandRunner, CommandSpec};

use crate::AdapterError;

/// State reported by `systemctl is-active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Activating,
    Inactive,
    Failed,
    Other(String),
}

impl UnitState {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "active" | "reloading" => UnitState::Active,
            "activating" => UnitState::Activating,
            "inactive" | "deactivating" => UnitState::Inactive,
            "failed" => UnitState::Failed,
            other => UnitState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Active => write!(f, "active"),
            UnitState::Activating => write!(f, "activating"),
            UnitState::Inactive => write!(f, "inactive"),
            UnitState::Failed => write!(f, "failed"),
            UnitState::Other(s) if s.is_empty() => write!(f, "unknown"),
            UnitState::Other(s) => write!(f, "{s}"),
        }
    }
}

fn systemctl(args: &[&str]) -> CommandSpec {
    CommandSpec::new("systemctl").args(args.iter().copied())
}

pub async fn state(runner: &dyn CommandRunner, unit: &str) -> Result<UnitState, AdapterError> {
    // is-active exits 3 for inactive units and 4 for unknown ones.
    let output = runner
        .run(&systemctl(&["is-active", unit]).accept_exit_codes(&[0, 1, 2, 3, 4]))
        .await?;
    Ok(UnitState::parse(&output.stdout))
}

pub async fn is_active(runner: &dyn CommandRunner, unit: &str) -> Result<bool, AdapterError> {
    Ok(state(runner, unit).await? == UnitState::Active)
}

pub async fn is_enabled(runner: &dyn CommandRunner, unit: &str) -> Result<bool, AdapterError> {
    let output = runner
        .run(&systemctl(&["is-enabled", unit]).accept_exit_codes(&[0, 1, 4]))
        .await?;
    Ok(output.stdout_trimmed() == "enabled")
}

/// Polls until `unit` is active, for services that take a moment to start.
pub async fn wait_active(
    runner: &dyn CommandRunner,
    unit: &str,
    attempts: u32,
    delay: Duration,
) -> Result<UnitState, AdapterError> {
    let mut last = UnitState::Other(String::new());
    for attempt in 1..=attempts.max(1) {
        last = state(runner, unit).await?;
        if last == UnitState::Active || last == UnitState::Failed {
            break;
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(last)
}

pub async fn daemon_reload(runner: &dyn CommandRunner) -> Result<(), AdapterError> {
    runner.run(&systemctl(&["daemon-reload"])).await?;
    Ok(())
}

pub async fn enable_now(runner: &dyn CommandRunner, unit: &str) -> Result<(), AdapterError> {
    runner.run(&systemctl(&["enable", "--now", unit])).await?;
    Ok(())
}

pub async fn enable(runner: &dyn CommandRunner, unit: &str) -> Result<(), AdapterError> {
    runner.run(&systemctl(&["enable", unit])).await?;
    Ok(())
}

pub async fn restart(runner: &dyn CommandRunner, unit: &str) -> Result<(), AdapterError> {
    runner.run(&systemctl(&["restart", unit])).await?;
    Ok(())
}

pub async fn reload(runner: &dyn CommandRunner, unit: &str) -> Result<(), AdapterError> {
    runner.run(&systemctl(&["reload", unit])).await?;
    Ok(())
}

pub async fn stop(runner: &dyn CommandRunner, unit: &str) -> Result<(), AdapterError> {
    runner.run(&systemctl(&["stop", unit])).await?;
    Ok(())
}

/// `(unit, state)` pairs for the run summary; probe errors become `unknown`.
pub async fn snapshot(runner: &dyn CommandRunner, units: &[&str]) -> Vec<(String, String)> {
    let mut rows = Vec::with_capacity(units.len());
    for unit in units {
        let state = match state(runner, unit).await {
            Ok(state) => state.to_string(),
            Err(e) => {
                tracing::debug!(unit, "could not query unit: {e}");
                "unknown".to_string()
            }
        };
        rows.push((unit.to_string(), state));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use piprov_command_runner::test_utils::MockRunner;

    #[tokio::test]
    async fn test_inactive_exit_code_is_not_an_error() {
        let runner = MockRunner::new();
        runner.on("systemctl is-active nqptp", 3, "inactive\n");

        assert_eq!(state(&runner, "nqptp").await.unwrap(), UnitState::Inactive);
        assert!(!is_active(&runner, "nqptp").await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_active_polls_until_active() {
        let runner = MockRunner::new();
        runner
            .on("systemctl is-active apache2", 3, "activating\n")
            .on("systemctl is-active apache2", 0, "active\n");

        let state = wait_active(&runner, "apache2", 5, Duration::ZERO).await.unwrap();
        assert_eq!(state, UnitState::Active);
        assert_eq!(runner.call_count("systemctl is-active"), 2);
    }

    #[tokio::test]
    async fn test_wait_active_stops_on_failed() {
        let runner = MockRunner::new();
        runner.on("systemctl is-active", 3, "failed\n");

        let state = wait_active(&runner, "cloudflared", 5, Duration::ZERO).await.unwrap();
        assert_eq!(state, UnitState::Failed);
        assert_eq!(runner.call_count("systemctl is-active"), 1);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let runner = MockRunner::new();
        runner
            .on("systemctl is-active nqptp", 0, "active\n")
            .on("systemctl is-active shairport-sync", 3, "failed\n");

        let rows = snapshot(&runner, &["nqptp", "shairport-sync"]).await;
        assert_eq!(
            rows,
            vec![
                ("nqptp".to_string(), "active".to_string()),
                ("shairport-sync".to_string(), "failed".to_string()),
            ]
        );
    }
}
