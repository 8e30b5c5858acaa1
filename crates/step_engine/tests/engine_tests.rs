//! Tests for the step engine state machine

use std::path::PathBuf;
use std::time::Duration;

use piprov_command_runner::test_utils::{output, MockRunner};
use piprov_command_runner::{CommandSpec, RunLog};
use piprov_reporter::Reporter;
use piprov_state_store::{StateStore, StepStatus};
use piprov_step_engine::test_utils::{call_log, CallLog, MockStep, MockUI};
use piprov_step_engine::{
    CleanupAction, Detection, EngineError, EngineOptions, RunReport, Step, StepContext, StepEngine,
    StepError, Verification,
};
use tempfile::TempDir;

fn options() -> EngineOptions {
    EngineOptions {
        force_steps: Vec::new(),
        network_attempts: 3,
        retry_delay: Duration::ZERO,
    }
}

fn state_dir(root: &TempDir) -> PathBuf {
    root.path().join("airplay")
}

async fn run_steps(
    root: &TempDir,
    runner: &MockRunner,
    steps: Vec<MockStep>,
    options: EngineOptions,
) -> (Result<RunReport, EngineError>, MockUI) {
    let steps: Vec<Box<dyn Step>> = steps
        .into_iter()
        .map(|s| Box::new(s) as Box<dyn Step>)
        .collect();
    let mut store = StateStore::open(&state_dir(root)).unwrap();
    let mut ui = MockUI::new();
    let result = StepEngine::new(runner, &mut store, options)
        .run(&steps, &mut ui, std::future::pending::<()>())
        .await;
    (result, ui)
}

fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn status(root: &TempDir, id: &str) -> StepStatus {
    StateStore::read(&state_dir(root))
        .unwrap()
        .unwrap()
        .status(id)
}

// ============================================================================
// Detection and idempotency
// ============================================================================

#[tokio::test]
async fn test_satisfied_detection_skips_apply() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, ui) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("build-dependencies", &log).satisfied("all packages installed")],
        options(),
    )
    .await;

    let report = result.unwrap();
    assert_eq!(report.skipped(), 1);
    assert_eq!(calls(&log), vec!["detect:build-dependencies"]);
    assert_eq!(status(&root, "build-dependencies"), StepStatus::Skipped);
    assert!(ui
        .events
        .contains(&"skipped:build-dependencies:all packages installed".to_string()));
}

#[tokio::test]
async fn test_missing_goes_through_apply_and_verify() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, ui) = run_steps(&root, &runner, vec![MockStep::new("nqptp", &log)], options()).await;

    let report = result.unwrap();
    assert_eq!(report.completed(), 1);
    assert_eq!(calls(&log), vec!["detect:nqptp", "apply:nqptp", "verify:nqptp"]);
    assert_eq!(status(&root, "nqptp"), StepStatus::Completed);
    assert_eq!(
        ui.events,
        vec!["start:1", "step_start:1/1:nqptp", "completed:nqptp", "complete:1:0"]
    );
}

#[tokio::test]
async fn test_second_run_skips_everything() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();

    let first = call_log();
    let (result, _) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("a", &first), MockStep::new("b", &first).satisfied("present")],
        options(),
    )
    .await;
    result.unwrap();

    let second = call_log();
    let (result, _) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("a", &second), MockStep::new("b", &second)],
        options(),
    )
    .await;

    let report = result.unwrap();
    assert_eq!(report.skipped(), 2);
    assert!(calls(&second).is_empty());
    assert_eq!(status(&root, "a"), StepStatus::Skipped);
    assert_eq!(status(&root, "b"), StepStatus::Skipped);
}

#[tokio::test]
async fn test_drifted_step_is_repaired() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, ui) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("audio-output", &log).drifted("config differs")],
        options(),
    )
    .await;

    let report = result.unwrap();
    assert_eq!(report.outcomes[0].status, StepStatus::Completed);
    assert!(report.outcomes[0].detail.starts_with("repaired (config differs)"));
    assert!(ui.events.contains(&"drifted:audio-output:config differs".to_string()));
    assert_eq!(
        calls(&log),
        vec!["detect:audio-output", "apply:audio-output", "verify:audio-output"]
    );
}

#[tokio::test]
async fn test_forced_step_skips_detection_and_reruns() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();

    let first = call_log();
    run_steps(&root, &runner, vec![MockStep::new("wp-config", &first)], options())
        .await
        .0
        .unwrap();

    let second = call_log();
    let forced = EngineOptions {
        force_steps: vec!["wp-config".into()],
        ..options()
    };
    let (result, _) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("wp-config", &second).satisfied("would skip")],
        forced,
    )
    .await;

    assert_eq!(result.unwrap().completed(), 1);
    assert_eq!(calls(&second), vec!["apply:wp-config", "verify:wp-config"]);
}

#[tokio::test]
async fn test_unknown_forced_step_fails_before_running() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();
    let forced = EngineOptions {
        force_steps: vec!["does-not-exist".into()],
        ..options()
    };

    let (result, _) = run_steps(&root, &runner, vec![MockStep::new("a", &log)], forced).await;

    assert!(matches!(result, Err(EngineError::UnknownStep(_))));
    assert!(calls(&log).is_empty());
}

// ============================================================================
// Failure, retry and resume
// ============================================================================

#[tokio::test]
async fn test_failure_halts_and_resume_continues_at_failed_step() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();

    let first = call_log();
    let (result, ui) = run_steps(
        &root,
        &runner,
        vec![
            MockStep::new("one", &first),
            MockStep::new("two", &first).always_fail(),
            MockStep::new("three", &first),
        ],
        options(),
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.step(), Some("two"));
    assert!(ui.events.contains(&"failed:two".to_string()));
    assert!(!calls(&first).iter().any(|c| c.ends_with(":three")));
    assert_eq!(status(&root, "one"), StepStatus::Completed);
    assert_eq!(status(&root, "two"), StepStatus::Failed);
    assert_eq!(status(&root, "three"), StepStatus::Pending);

    let second = call_log();
    let (result, _) = run_steps(
        &root,
        &runner,
        vec![
            MockStep::new("one", &second),
            MockStep::new("two", &second),
            MockStep::new("three", &second),
        ],
        options(),
    )
    .await;

    result.unwrap();
    assert_eq!(
        calls(&second),
        vec![
            "detect:two",
            "apply:two",
            "verify:two",
            "detect:three",
            "apply:three",
            "verify:three"
        ]
    );
    let state = StateStore::read(&state_dir(&root)).unwrap().unwrap();
    assert_eq!(state.step("two").unwrap().attempts, 2);
}

#[tokio::test]
async fn test_network_bound_step_is_retried() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, ui) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("wordpress-files", &log).network_bound().fail_times(2)],
        options(),
    )
    .await;

    let report = result.unwrap();
    assert_eq!(report.outcomes[0].detail, "applied wordpress-files (attempt 3)");
    assert!(ui.events.contains(&"retry:wordpress-files:1/3".to_string()));
    assert!(ui.events.contains(&"retry:wordpress-files:2/3".to_string()));
    assert_eq!(
        calls(&log).iter().filter(|c| c.starts_with("apply")).count(),
        3
    );
}

#[tokio::test]
async fn test_network_retries_are_bounded() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, _) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("cloudflared", &log).network_bound().fail_times(5)],
        options(),
    )
    .await;

    assert!(matches!(result, Err(EngineError::StepFailed { .. })));
    assert_eq!(
        calls(&log).iter().filter(|c| c.starts_with("apply")).count(),
        3
    );
}

#[tokio::test]
async fn test_local_step_is_not_retried() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, _) = run_steps(&root, &runner, vec![MockStep::new("database", &log).fail_times(1)], options()).await;

    assert!(result.is_err());
    assert_eq!(calls(&log).iter().filter(|c| c.starts_with("apply")).count(), 1);
}

#[tokio::test]
async fn test_verification_failure_marks_step_failed() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let log = call_log();

    let (result, _) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("nqptp-service", &log).fail_verify("nqptp is inactive")],
        options(),
    )
    .await;

    match result.unwrap_err() {
        EngineError::VerificationFailed { step, reason } => {
            assert_eq!(step, "nqptp-service");
            assert_eq!(reason, "nqptp is inactive");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(status(&root, "nqptp-service"), StepStatus::Failed);
}

#[tokio::test]
async fn test_command_failure_records_stderr_tail() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    runner.on_output("make", output(2, "", "compiling...\nerror: missing libsoxr\n"));
    let log = call_log();

    let (result, _) = run_steps(
        &root,
        &runner,
        vec![MockStep::new("shairport-sync", &log).runs(&["make", "-j4"])],
        options(),
    )
    .await;

    let err = result.unwrap_err();
    assert!(err.diagnostic().unwrap().contains("missing libsoxr"));
    let state = StateStore::read(&state_dir(&root)).unwrap().unwrap();
    let detail = state.step("shairport-sync").unwrap().detail.clone().unwrap();
    assert!(detail.contains("exited with code 2"));
    assert!(detail.contains("missing libsoxr"));
}

#[tokio::test]
async fn test_failure_rolls_back_only_failing_step() {
    let root = TempDir::new().unwrap();
    let kept = root.path().join("kept.conf");
    let partial = root.path().join("partial.conf");
    std::fs::write(&kept, "ok").unwrap();
    std::fs::write(&partial, "half written").unwrap();

    let runner = MockRunner::new();
    let log = call_log();
    let (result, ui) = run_steps(
        &root,
        &runner,
        vec![
            MockStep::new("one", &log).with_cleanup(CleanupAction::RemoveFile(kept.clone())),
            MockStep::new("two", &log)
                .with_cleanup(CleanupAction::RemoveFile(partial.clone()))
                .always_fail(),
        ],
        options(),
    )
    .await;

    assert!(result.is_err());
    assert!(kept.exists());
    assert!(!partial.exists());
    assert!(ui
        .events
        .iter()
        .any(|e| e.starts_with("rollback:two:remove")));
    assert_eq!(status(&root, "one"), StepStatus::Completed);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_interrupt_rolls_back_this_run_only() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();

    // A step completed by an earlier run.
    let earlier = call_log();
    run_steps(&root, &runner, vec![MockStep::new("build-dependencies", &earlier)], options())
        .await
        .0
        .unwrap();

    let created = root.path().join("nqptp.service");
    std::fs::write(&created, "[Unit]").unwrap();
    let original = root.path().join("shairport-sync.conf");
    let backup = root.path().join("shairport-sync.conf.piprov-bak");
    std::fs::write(&original, "new, half written").unwrap();
    std::fs::write(&backup, "original").unwrap();

    let log = call_log();
    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(MockStep::new("build-dependencies", &log)),
        Box::new(
            MockStep::new("nqptp-service", &log)
                .with_cleanup(CleanupAction::RemoveFile(created.clone()))
                .with_cleanup(CleanupAction::StopService("nqptp".into())),
        ),
        Box::new(
            MockStep::new("audio-output", &log)
                .with_cleanup(CleanupAction::RestoreFile {
                    original: original.clone(),
                    backup: backup.clone(),
                })
                .hang(),
        ),
    ];

    let mut store = StateStore::open(&state_dir(&root)).unwrap();
    let mut ui = MockUI::new();
    let result = StepEngine::new(&runner, &mut store, options())
        .run(&steps, &mut ui, tokio::time::sleep(Duration::from_millis(100)))
        .await;
    drop(store);

    match result.unwrap_err() {
        EngineError::Interrupted { step } => assert_eq!(step, "audio-output"),
        other => panic!("unexpected error: {other}"),
    }

    // Newest first: restore, then stop, then remove.
    let rollbacks: Vec<&String> = ui.events.iter().filter(|e| e.starts_with("rollback")).collect();
    assert_eq!(rollbacks.len(), 3);
    assert!(rollbacks[0].starts_with("rollback:audio-output:restore"));
    assert_eq!(rollbacks[1], "rollback:nqptp-service:stop service nqptp");
    assert!(rollbacks[2].starts_with("rollback:nqptp-service:remove"));

    assert_eq!(runner.calls(), vec!["systemctl stop nqptp"]);
    assert!(!created.exists());
    assert_eq!(std::fs::read_to_string(&original).unwrap(), "original");
    assert!(!backup.exists());

    assert_eq!(status(&root, "audio-output"), StepStatus::Pending);
    assert_eq!(status(&root, "nqptp-service"), StepStatus::Pending);
    assert!(status(&root, "build-dependencies").is_done());
}

// ============================================================================
// Secrets in failure output
// ============================================================================

const DB_SECRET: &str = "S3cretPassw0rdXYZ";

/// Creates a database user; the password reaches mysql over stdin.
struct CreateUserStep {
    /// Passed to the command's own redactions.
    redact: bool,
    /// Remembers a generated secret before running.
    generated: Option<&'static str>,
}

#[async_trait::async_trait]
impl Step for CreateUserStep {
    fn id(&self) -> &str {
        "database"
    }

    fn description(&self) -> &str {
        "Create the database user"
    }

    async fn detect(&self, _ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        Ok(Detection::Missing)
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        if let Some(secret) = self.generated {
            ctx.remember("tunnel_secret", secret, true)?;
        }
        let mut spec = CommandSpec::new("mysql")
            .stdin(format!("CREATE USER 'wp'@'localhost' IDENTIFIED BY '{DB_SECRET}';"));
        if self.redact {
            spec = spec.redact(DB_SECRET);
        }
        ctx.run(&spec).await?;
        Ok(())
    }

    async fn verify(&self, _ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        Ok(Verification::Passed)
    }
}

/// Runs `step` against a mysql that echoes `stderr`; returns run log,
/// terminal output and state file.
async fn run_failing(step: CreateUserStep, stderr: &str, seed: bool) -> (String, String, String) {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    runner.on_output("mysql", output(1, "", stderr));

    let log = RunLog::open(&root.path().join("run.log")).unwrap();
    let mut store = StateStore::open(&state_dir(&root)).unwrap();
    if seed {
        store.set("db_password", DB_SECRET, true).unwrap();
    }
    let mut reporter = Reporter::buffered(Some(log.clone()));
    let steps: Vec<Box<dyn Step>> = vec![Box::new(step)];

    let result = StepEngine::new(&runner, &mut store, options())
        .with_log(Some(log.clone()))
        .run(&steps, &mut reporter, std::future::pending::<()>())
        .await;
    drop(store);
    assert!(matches!(result, Err(EngineError::StepFailed { .. })));

    (
        std::fs::read_to_string(log.path()).unwrap(),
        reporter.captured(),
        std::fs::read_to_string(state_dir(&root).join("state.json")).unwrap(),
    )
}

#[tokio::test]
async fn test_failed_step_keeps_redacted_secret_out_of_log_and_terminal() {
    let stderr = format!("ERROR 1064 (42000): syntax error near 'IDENTIFIED BY '{DB_SECRET}''");
    let step = CreateUserStep {
        redact: true,
        generated: None,
    };

    let (log, terminal, state) = run_failing(step, &stderr, false).await;

    assert!(!log.contains(DB_SECRET), "run log: {log}");
    assert!(!terminal.contains(DB_SECRET), "terminal: {terminal}");
    assert!(!state.contains(DB_SECRET));
    assert!(log.contains("syntax error near 'IDENTIFIED BY '********''"));
}

#[tokio::test]
async fn test_sensitive_state_values_are_masked_without_command_redactions() {
    let stderr = format!("ERROR 1045: Access denied (password '{DB_SECRET}', secret 'tunnelsecret42')");
    let step = CreateUserStep {
        redact: false,
        generated: Some("tunnelsecret42"),
    };

    let (log, terminal, _) = run_failing(step, &stderr, true).await;

    for secret in [DB_SECRET, "tunnelsecret42"] {
        assert!(!log.contains(secret), "run log: {log}");
        assert!(!terminal.contains(secret), "terminal: {terminal}");
    }
    assert!(log.contains("Access denied"));
}
