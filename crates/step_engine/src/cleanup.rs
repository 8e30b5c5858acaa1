use std::io;

use piprov_command_runner::{CommandRunner, CommandSpec};

use crate::step::CleanupAction;
use crate::ui::EngineUI;

/// Cleanup actions registered during the current run, tagged by step.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    entries: Vec<(String, CleanupAction)>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, step: &str, actions: impl IntoIterator<Item = CleanupAction>) {
        self.entries
            .extend(actions.into_iter().map(|a| (step.to_string(), a)));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Steps owning at least one action, in registration order.
    pub fn step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for (id, _) in &self.entries {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Undoes everything, newest first. Failures are reported and skipped.
    pub async fn rollback<UI: EngineUI + ?Sized>(self, runner: &dyn CommandRunner, ui: &mut UI) {
        for (step, action) in self.entries.into_iter().rev() {
            match undo(&action, runner).await {
                Ok(()) => ui.on_rollback(&step, &action.to_string(), None),
                Err(e) => {
                    tracing::warn!(step = %step, %action, "cleanup failed: {e}");
                    ui.on_rollback(&step, &action.to_string(), Some(e.as_str()));
                }
            }
        }
    }
}

async fn undo(action: &CleanupAction, runner: &dyn CommandRunner) -> Result<(), String> {
    match action {
        CleanupAction::StopService(unit) => runner
            .run(&CommandSpec::new("systemctl").args(["stop", unit.as_str()]))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string()),
        CleanupAction::RestoreFile { original, backup } => tokio::fs::rename(backup, original)
            .await
            .map_err(|e| format!("{} -> {}: {e}", backup.display(), original.display())),
        CleanupAction::RemoveFile(path) => ignore_missing(tokio::fs::remove_file(path).await)
            .map_err(|e| format!("{}: {e}", path.display())),
        CleanupAction::RemoveDir(path) => ignore_missing(tokio::fs::remove_dir_all(path).await)
            .map_err(|e| format!("{}: {e}", path.display())),
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
