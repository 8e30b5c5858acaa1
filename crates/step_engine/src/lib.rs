pub mod cleanup;
pub mod engine;
pub mod plan;
pub mod step;
pub mod ui;

pub use cleanup::CleanupRegistry;
pub use engine::{EngineError, RunReport, StepEngine, StepOutcome};
pub use plan::{plan_steps, EngineOptions, PlannedAction, PlannedStep};
pub use step::{CleanupAction, Detection, Step, StepContext, StepError, Verification};
pub use ui::EngineUI;

// ============================================================================
// Test Utilities - exported for integration tests
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use piprov_command_runner::CommandSpec;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Shared, ordered record of step calls (`"detect:nqptp"`, ...).
    pub type CallLog = Arc<Mutex<Vec<String>>>;

    pub fn call_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Configurable step for engine tests.
    pub struct MockStep {
        id: String,
        description: String,
        network: bool,
        detections: Mutex<VecDeque<Detection>>,
        transient_failures: Mutex<u32>,
        always_fail: bool,
        verification: Verification,
        cleanup: Vec<CleanupAction>,
        command: Option<Vec<String>>,
        hang: bool,
        log: CallLog,
    }

    impl MockStep {
        pub fn new(id: &str, log: &CallLog) -> Self {
            Self {
                id: id.to_string(),
                description: format!("mock step {id}"),
                network: false,
                detections: Mutex::new(VecDeque::new()),
                transient_failures: Mutex::new(0),
                always_fail: false,
                verification: Verification::Passed,
                cleanup: Vec::new(),
                command: None,
                hang: false,
                log: log.clone(),
            }
        }

        pub fn satisfied(self, detail: &str) -> Self {
            self.detects(Detection::Satisfied(detail.to_string()))
        }

        pub fn drifted(self, reason: &str) -> Self {
            self.detects(Detection::Drifted(reason.to_string()))
        }

        /// Queues a detection result; the last one repeats.
        pub fn detects(self, detection: Detection) -> Self {
            self.detections.lock().unwrap().push_back(detection);
            self
        }

        pub fn network_bound(mut self) -> Self {
            self.network = true;
            self
        }

        /// The first `n` applies fail with a retryable error.
        pub fn fail_times(self, n: u32) -> Self {
            *self.transient_failures.lock().unwrap() = n;
            self
        }

        pub fn always_fail(mut self) -> Self {
            self.always_fail = true;
            self
        }

        pub fn fail_verify(mut self, reason: &str) -> Self {
            self.verification = Verification::Failed(reason.to_string());
            self
        }

        pub fn with_cleanup(mut self, action: CleanupAction) -> Self {
            self.cleanup.push(action);
            self
        }

        /// Apply runs this command through the context's runner.
        pub fn runs(mut self, command: &[&str]) -> Self {
            self.command = Some(command.iter().map(|s| s.to_string()).collect());
            self
        }

        /// Apply never finishes; for cancellation tests.
        pub fn hang(mut self) -> Self {
            self.hang = true;
            self
        }

        fn record(&self, call: &str) {
            self.log.lock().unwrap().push(format!("{call}:{}", self.id));
        }
    }

    #[async_trait]
    impl Step for MockStep {
        fn id(&self) -> &str {
            &self.id
        }

        fn description(&self) -> &str {
            &self.description
        }

        fn network_bound(&self) -> bool {
            self.network
        }

        async fn detect(&self, _ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
            self.record("detect");
            let mut queue = self.detections.lock().unwrap();
            let detection = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            Ok(detection.unwrap_or(Detection::Missing))
        }

        async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
            self.record("apply");
            for action in &self.cleanup {
                ctx.on_cleanup(action.clone());
            }
            if let Some(command) = &self.command {
                let spec = CommandSpec::new(command[0].clone()).args(command[1..].iter().cloned());
                ctx.run(&spec).await?;
            }
            if self.hang {
                std::future::pending::<()>().await;
            }

            let transient = {
                let mut remaining = self.transient_failures.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    true
                } else {
                    false
                }
            };
            if transient {
                return Err(StepError::external("mock", "temporarily unavailable"));
            }
            if self.always_fail {
                return Err(StepError::failed(format!("{} exploded", self.id)));
            }
            ctx.note(format!("applied {} (attempt {})", self.id, ctx.attempt()));
            Ok(())
        }

        async fn verify(&self, _ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
            self.record("verify");
            Ok(self.verification.clone())
        }
    }

    /// Records every engine event as a string.
    #[derive(Default)]
    pub struct MockUI {
        pub events: Vec<String>,
    }

    impl MockUI {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl EngineUI for MockUI {
        fn on_start(&mut self, total: usize) {
            self.events.push(format!("start:{total}"));
        }
        fn on_step_start(&mut self, index: usize, total: usize, id: &str, _description: &str) {
            self.events.push(format!("step_start:{}/{total}:{id}", index + 1));
        }
        fn on_step_skipped(&mut self, id: &str, reason: &str) {
            self.events.push(format!("skipped:{id}:{reason}"));
        }
        fn on_step_drifted(&mut self, id: &str, reason: &str) {
            self.events.push(format!("drifted:{id}:{reason}"));
        }
        fn on_retry(&mut self, id: &str, attempt: u32, max: u32, _error: &str) {
            self.events.push(format!("retry:{id}:{attempt}/{max}"));
        }
        fn on_step_completed(&mut self, id: &str, _detail: &str) {
            self.events.push(format!("completed:{id}"));
        }
        fn on_step_failed(&mut self, id: &str, _error: &str, _diagnostic: Option<&str>) {
            self.events.push(format!("failed:{id}"));
        }
        fn on_rollback(&mut self, id: &str, action: &str, error: Option<&str>) {
            match error {
                None => self.events.push(format!("rollback:{id}:{action}")),
                Some(_) => self.events.push(format!("rollback_failed:{id}:{action}")),
            }
        }
        fn on_interrupted(&mut self, id: &str) {
            self.events.push(format!("interrupted:{id}"));
        }
        fn on_complete(&mut self, report: &RunReport) {
            self.events.push(format!("complete:{}:{}", report.completed(), report.skipped()));
        }
    }
}
