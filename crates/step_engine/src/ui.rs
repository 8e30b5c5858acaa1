use piprov_reporter::Reporter;

use crate::engine::RunReport;

/// Progress events emitted while the engine runs.
pub trait EngineUI {
    /// Called once before the first step.
    fn on_start(&mut self, total: usize);

    fn on_step_start(&mut self, index: usize, total: usize, id: &str, description: &str);

    /// Step not applied: already satisfied, or done in an earlier run.
    fn on_step_skipped(&mut self, id: &str, reason: &str);

    /// Detection found the goal present but wrong; it will be repaired.
    fn on_step_drifted(&mut self, id: &str, reason: &str) {
        let _ = (id, reason);
    }

    /// A network-bound step failed `attempt` of `max` and will be retried.
    fn on_retry(&mut self, id: &str, attempt: u32, max: u32, error: &str);

    fn on_step_completed(&mut self, id: &str, detail: &str);

    fn on_step_failed(&mut self, id: &str, error: &str, diagnostic: Option<&str>);

    fn on_rollback(&mut self, id: &str, action: &str, error: Option<&str>);

    fn on_interrupted(&mut self, id: &str);

    fn on_complete(&mut self, report: &RunReport);
}

impl EngineUI for Reporter {
    fn on_start(&mut self, total: usize) {
        self.section(&format!("Installing ({total} steps)"));
    }

    fn on_step_start(&mut self, index: usize, total: usize, id: &str, description: &str) {
        self.info(&format!("[{}/{total}] {id}: {description}", index + 1));
    }

    fn on_step_skipped(&mut self, id: &str, reason: &str) {
        self.success(&format!("{id}: skipped ({reason})"));
    }

    fn on_step_drifted(&mut self, id: &str, reason: &str) {
        self.warning(&format!("{id}: {reason}, repairing"));
    }

    fn on_retry(&mut self, id: &str, attempt: u32, max: u32, error: &str) {
        self.warning(&format!("{id}: attempt {attempt}/{max} failed: {error}"));
    }

    fn on_step_completed(&mut self, id: &str, detail: &str) {
        self.success(&format!("{id}: {detail}"));
    }

    fn on_step_failed(&mut self, id: &str, error: &str, diagnostic: Option<&str>) {
        self.error(&format!("{id} failed: {error}"));
        if let Some(tail) = diagnostic {
            self.detail(tail);
        }
    }

    fn on_rollback(&mut self, id: &str, action: &str, error: Option<&str>) {
        match error {
            None => self.info(&format!("rolled back {id}: {action}")),
            Some(e) => self.warning(&format!("could not {action} for {id}: {e}")),
        }
    }

    fn on_interrupted(&mut self, id: &str) {
        self.warning(&format!("Interrupted during {id}, cleaning up"));
    }

    fn on_complete(&mut self, report: &RunReport) {
        self.success(&format!(
            "All steps done ({} applied, {} already present)",
            report.completed(),
            report.skipped()
        ));
    }
}
