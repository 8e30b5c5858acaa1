//! `piprov install`: preflight, parameters, steps, summary.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context};

use piprov_collector::{CollectError, Collector, Prompter, TerminalPrompter};
use piprov_command_runner::{Backoff, RunLog, RunPolicy, SystemRunner};
use piprov_config::{Config, RunnerConfig};
use piprov_preflight::{gate, run_preflight, HostProbe, PreflightReport};
use piprov_recipes::{Recipe, RecipeContext};
use piprov_reporter::{Reporter, Summary};
use piprov_state_store::{StateError, StateStore};
use piprov_step_engine::{EngineError, EngineOptions, StepEngine};
use piprov_system_adapters::systemd;

use crate::{InstallArgs, EXIT_CANCELLED, RUN_LOG, SUMMARY};

fn run_policy(config: &RunnerConfig) -> RunPolicy {
    let backoff = if config.exponential_backoff {
        Backoff::Exponential {
            initial: config.backoff(),
            max: config.max_backoff(),
        }
    } else {
        Backoff::Fixed(config.backoff())
    };
    RunPolicy {
        timeout: config.timeout(),
        retries: config.retries,
        backoff,
    }
}

/// Resolves when the user presses Ctrl-C; never if the handler fails.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

fn cancelled(reporter: &Reporter) -> ExitCode {
    reporter.warning("Cancelled by user");
    ExitCode::from(EXIT_CANCELLED)
}

fn print_preflight(reporter: &Reporter, report: &PreflightReport) {
    for outcome in &report.passed {
        reporter.success(&outcome.to_string());
    }
    for outcome in &report.warnings {
        reporter.warning(&outcome.to_string());
    }
    for outcome in &report.failed {
        reporter.error(&outcome.to_string());
    }
}

pub async fn run(config: Config, args: InstallArgs) -> anyhow::Result<ExitCode> {
    let profile = args.profile;
    let dir = config.profile_dir(profile.as_str());
    let interactive = !args.non_interactive;

    if args.resume && matches!(StateStore::read(&dir), Ok(None)) {
        bail!("nothing to resume: no earlier {profile} run recorded in {}", dir.display());
    }

    // Without root the state directory is usually not writable; the
    // preflight root check reports that properly.
    let log = match RunLog::open(&dir.join(RUN_LOG)) {
        Ok(log) => Some(log),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), "run log unavailable: {e}");
            None
        }
    };
    let reporter = Reporter::terminal(log.clone());
    if let Some(log) = &log {
        log.record("run", &format!("piprov install {profile}"));
    }

    let runner = match &log {
        Some(log) => SystemRunner::with_log(log.clone()),
        None => SystemRunner::new(),
    }
    .with_policy(run_policy(&config.runner));

    let ctx = RecipeContext::new(config.clone());
    let recipe = piprov_recipes::build(profile, &ctx);
    let mut prompter = TerminalPrompter::new();

    // ------------------------------------------------------------------
    // Preflight
    // ------------------------------------------------------------------
    reporter.section(&format!("Preflight checks for {profile}"));
    let report = run_preflight(&HostProbe, &recipe.checks).await;
    print_preflight(&reporter, &report);

    let mut prompt_cancelled = false;
    let gated = gate(report, |outcome| {
        if args.allow_preflight.iter().any(|name| name == &outcome.name) {
            return true;
        }
        if !interactive || prompt_cancelled {
            return false;
        }
        let question = format!("Continue although '{}' failed?", outcome.name);
        match prompter.confirm(&question) {
            Ok(answer) => answer,
            Err(_) => {
                prompt_cancelled = true;
                false
            }
        }
    });
    if prompt_cancelled {
        return Ok(cancelled(&reporter));
    }
    if let Err(e) = gated {
        reporter.error(&e.to_string());
        reporter.detail("Nothing was changed. Override a check with --allow-preflight <name>.");
        return Ok(ExitCode::FAILURE);
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------
    let mut store = match StateStore::open(&dir) {
        Ok(store) => store,
        Err(StateError::Corrupt { path, reason }) => {
            reporter.error(&format!("{} is corrupt: {reason}", path.display()));
            let discard = interactive
                && prompter
                    .confirm("Set it aside and start from scratch?")
                    .unwrap_or(false);
            if !discard {
                bail!("refusing to continue with corrupt state in {}", path.display());
            }
            StateStore::open_discarding_corrupt(&dir)?
        }
        Err(e) => return Err(e).context("cannot open installation state"),
    };

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------
    reporter.section("Configuration");
    let collected = Collector::new(&mut prompter, interactive)
        .with_parameters(config.parameters.clone())
        .with_log(log.clone())
        .collect_all(&recipe.parameters, &mut store)
        .await;
    match collected {
        Ok(values) => reporter.success(&format!("{} parameters resolved", values.len())),
        Err(CollectError::Cancelled) => return Ok(cancelled(&reporter)),
        Err(e) => {
            reporter.error(&e.to_string());
            return Ok(ExitCode::FAILURE);
        }
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------
    let options = EngineOptions {
        force_steps: args.force_steps.clone(),
        network_attempts: config.engine.network_attempts,
        retry_delay: config.engine.retry_delay(),
    };
    let mut ui = reporter.clone();
    let result = StepEngine::new(&runner, &mut store, options)
        .with_log(log.clone())
        .run(&recipe.steps, &mut ui, ctrl_c())
        .await;

    let (outcome, code) = match &result {
        Ok(_) => ("completed".to_string(), ExitCode::SUCCESS),
        Err(EngineError::Interrupted { step }) => (
            format!("cancelled during {step}"),
            ExitCode::from(EXIT_CANCELLED),
        ),
        Err(e) => (format!("failed: {e}"), ExitCode::FAILURE),
    };

    write_summary(&reporter, &runner, &store, &recipe, &outcome, log.as_ref(), &dir).await;

    match result {
        Ok(_) => reporter.success(&format!("{profile} is ready")),
        Err(EngineError::Interrupted { .. }) => {
            reporter.warning("Changes made by this run were rolled back.");
        }
        Err(e) => {
            if e.step().is_none() {
                reporter.error(&e.to_string());
            }
            if let Some(log) = &log {
                reporter.detail(&format!("Run log: {}", log.path().display()));
            }
            reporter.detail(&format!(
                "Fix the problem and run `piprov install {profile}` again; finished steps are skipped."
            ));
        }
    }
    Ok(code)
}

async fn write_summary(
    reporter: &Reporter,
    runner: &SystemRunner,
    store: &StateStore,
    recipe: &Recipe,
    outcome: &str,
    log: Option<&RunLog>,
    dir: &Path,
) {
    let services = systemd::snapshot(runner, &recipe.services).await;
    let mut summary = Summary::from_state(store.state(), outcome)
        .with_services(services)
        .with_files(recipe.files.clone());
    if let Some(log) = log {
        summary = summary.with_log_path(log.path());
    }

    if let Err(e) = reporter.summary(&summary, &dir.join(SUMMARY)) {
        reporter.warning(&format!("could not write {SUMMARY}: {e}"));
    }
}
