use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use piprov_collector::{Prompter, TerminalPrompter};
use piprov_config::Config;
use piprov_recipes::{Profile, RecipeContext};
use piprov_reporter::Summary;
use piprov_state_store::StateStore;

mod install;

/// Exit code for a run the user cancelled (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

pub const RUN_LOG: &str = "run.log";
pub const SUMMARY: &str = "summary.txt";
/// Where `reset` moves the last summary.
const PREVIOUS_SUMMARY: &str = "summary.previous.txt";

#[derive(Parser)]
#[command(name = "piprov", version, about = "Idempotent Raspberry Pi provisioning")]
struct Cli {
    /// Config file to use instead of ./.piprov.toml or /etc/piprov/config.toml
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// Diagnostics on stderr (-v debug, -vv trace); PIPROV_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a profile, skipping everything that is already in place
    Install(InstallArgs),
    /// Show recorded step states and stored parameters
    Status {
        /// airplay or wordpress
        profile: Profile,
    },
    /// List the steps of a profile
    Steps {
        /// airplay or wordpress
        profile: Profile,
    },
    /// Delete the recorded state of a profile
    Reset {
        /// airplay or wordpress
        profile: Profile,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
pub struct InstallArgs {
    /// airplay or wordpress
    pub profile: Profile,

    /// Fail instead of prompting; parameters come from PIPROV_* variables
    /// or the config file
    #[arg(long)]
    pub non_interactive: bool,

    /// Continue an earlier run; fails if there is none
    #[arg(long)]
    pub resume: bool,

    /// Re-run a step even if it is recorded as done (repeatable)
    #[arg(long = "force-step", value_name = "ID")]
    pub force_steps: Vec<String>,

    /// Proceed although this preflight check failed (repeatable)
    #[arg(long = "allow-preflight", value_name = "CHECK")]
    pub allow_preflight: Vec<String>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .with_env_var("PIPROV_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let (config, source) = Config::discover(cli.config_file.as_deref(), &cwd)?;
    match &source {
        Some(path) => tracing::debug!(config = %path.display(), "loaded config"),
        None => tracing::debug!("no config file, using defaults"),
    }

    match cli.command {
        Commands::Install(args) => install::run(config, args).await,
        Commands::Status { profile } => status(&config, profile),
        Commands::Steps { profile } => steps(config, profile),
        Commands::Reset { profile, yes } => reset(&config, profile, yes),
    }
}

fn status(config: &Config, profile: Profile) -> anyhow::Result<ExitCode> {
    let dir = config.profile_dir(profile.as_str());
    let Some(state) = StateStore::read(&dir)? else {
        println!("No recorded state for {profile} in {}.", dir.display());
        return Ok(ExitCode::SUCCESS);
    };

    let summary = Summary::from_state(&state, "recorded");
    print!("{}", summary.render());

    let summary_path = dir.join(SUMMARY);
    if summary_path.exists() {
        println!("\nLast summary: {}", summary_path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn steps(config: Config, profile: Profile) -> anyhow::Result<ExitCode> {
    let recipe = piprov_recipes::build(profile, &RecipeContext::new(config));
    let width = recipe.steps.iter().map(|s| s.id().len()).max().unwrap_or(0);

    println!("{profile}: {}\n", profile.description());
    for (i, step) in recipe.steps.iter().enumerate() {
        let network = if step.network_bound() { "  (network)" } else { "" };
        println!("{:>2}. {:<width$}  {}{network}", i + 1, step.id(), step.description());
    }
    Ok(ExitCode::SUCCESS)
}

fn reset(config: &Config, profile: Profile, yes: bool) -> anyhow::Result<ExitCode> {
    let dir = config.profile_dir(profile.as_str());
    if !yes {
        let question = format!("Forget all recorded progress for {profile} in {}?", dir.display());
        // EOF on the prompt counts as "no".
        let confirmed = TerminalPrompter::new().confirm(&question).unwrap_or(false);
        if !confirmed {
            println!("Nothing changed.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let removed = StateStore::reset(&dir)?;
    let summary = dir.join(SUMMARY);
    let archived = if summary.exists() {
        let previous = dir.join(PREVIOUS_SUMMARY);
        std::fs::rename(&summary, &previous)
            .with_context(|| format!("cannot move {}", summary.display()))?;
        Some(previous)
    } else {
        None
    };

    if removed {
        println!("Removed state for {profile}. The next install starts from detection.");
    } else {
        println!("No recorded state for {profile} in {}.", dir.display());
    }
    if let Some(previous) = archived {
        println!("Last summary moved to {}.", previous.display());
    }
    let log = dir.join(RUN_LOG);
    if log.exists() {
        println!("Run log kept: {}", log.display());
    }
    Ok(ExitCode::SUCCESS)
}
