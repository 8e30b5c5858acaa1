use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use piprov_command_runner::{run_log, REDACTED};
use piprov_state_store::{InstallationState, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLine {
    pub id: String,
    pub status: StepStatus,
    pub detail: Option<String>,
}

/// End-of-run record: what was configured, what ran, what it touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub profile: String,
    pub outcome: String,
    pub generated_at: String,
    /// Resolved parameters, sensitive values already masked.
    pub config: Vec<(String, String)>,
    pub steps: Vec<StepLine>,
    /// Unit name and its state at the end of the run.
    pub services: Vec<(String, String)>,
    pub files: Vec<PathBuf>,
    pub log_path: Option<PathBuf>,
    secrets: Vec<String>,
}

impl Summary {
    pub fn from_state(state: &InstallationState, outcome: &str) -> Self {
        let config = state
            .config
            .iter()
            .map(|(key, value)| {
                let shown = if value.sensitive {
                    REDACTED.to_string()
                } else {
                    value.value.clone()
                };
                (key.clone(), shown)
            })
            .collect();

        let secrets = state
            .config
            .values()
            .filter(|v| v.sensitive && !v.value.is_empty())
            .map(|v| v.value.clone())
            .collect();

        let steps = state
            .steps
            .iter()
            .map(|entry| StepLine {
                id: entry.id.clone(),
                status: entry.result.status,
                detail: entry.result.detail.clone(),
            })
            .collect();

        Self {
            profile: state.profile.clone(),
            outcome: outcome.to_string(),
            generated_at: run_log::timestamp(),
            config,
            steps,
            services: Vec::new(),
            files: Vec::new(),
            log_path: None,
            secrets,
        }
    }

    pub fn with_services(mut self, services: Vec<(String, String)>) -> Self {
        self.services = services;
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn with_log_path(mut self, path: &Path) -> Self {
        self.log_path = Some(path.to_path_buf());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "piprov summary: {}", self.profile);
        let _ = writeln!(out, "Outcome:   {}", self.outcome);
        let _ = writeln!(out, "Generated: {}", self.generated_at);

        if !self.config.is_empty() {
            let width = self.config.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
            let _ = writeln!(out, "\nConfiguration");
            for (key, value) in &self.config {
                let _ = writeln!(out, "  {key:<width$}  {value}");
            }
        }

        if !self.steps.is_empty() {
            let width = self.steps.iter().map(|s| s.id.len()).max().unwrap_or(0);
            let _ = writeln!(out, "\nSteps");
            for step in &self.steps {
                let status = step.status.to_string();
                match &step.detail {
                    Some(detail) => {
                        let _ = writeln!(out, "  {:<width$}  {status:<11}  {detail}", step.id);
                    }
                    None => {
                        let _ = writeln!(out, "  {:<width$}  {status}", step.id);
                    }
                }
            }
        }

        if !self.services.is_empty() {
            let width = self.services.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
            let _ = writeln!(out, "\nServices");
            for (unit, state) in &self.services {
                let _ = writeln!(out, "  {unit:<width$}  {state}");
            }
        }

        if !self.files.is_empty() {
            let _ = writeln!(out, "\nFiles");
            for file in &self.files {
                let _ = writeln!(out, "  {}", file.display());
            }
        }

        if let Some(log) = &self.log_path {
            let _ = writeln!(out, "\nRun log: {}", log.display());
        }

        // Step details come from command output and may echo a secret.
        self.secrets
            .iter()
            .fold(out, |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// Writes the rendered summary with mode 0600, replacing any previous one.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        file.write_all(self.render().as_bytes())?;
        file.sync_all()
    }
}
