//! Step building blocks shared by the recipes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use piprov_config::Config;
use piprov_preflight::{mib, Check, Requirement, BINARIES, DISK_SPACE, MEMORY, NETWORK, ROOT};
use piprov_step_engine::{CleanupAction, Detection, Step, StepContext, StepError, Verification};
use piprov_system_adapters::systemd::{self, UnitState};
use piprov_system_adapters::download::{self, Downloader};
use piprov_system_adapters::{apt, files};

const DEFAULT_MIN_MEMORY_MIB: u64 = 256;
const SERVICE_POLLS: u32 = 10;

/// Root, network, disk, memory (advisory) and the package tooling.
pub fn preflight_checks(config: &Config, min_disk_mib: u64, disk_path: &Path) -> Vec<Check> {
    let preflight = &config.preflight;
    vec![
        Check::blocking(ROOT, Requirement::Root),
        Check::blocking(
            NETWORK,
            Requirement::Network {
                targets: preflight.probe_targets.clone(),
                timeout: preflight.probe_timeout(),
                attempts: preflight.probe_attempts,
                delay: preflight.probe_delay(),
            },
        ),
        Check::blocking(
            DISK_SPACE,
            Requirement::DiskSpace {
                path: disk_path.to_path_buf(),
                min_bytes: mib(preflight.min_disk_mb.unwrap_or(min_disk_mib)),
            },
        ),
        Check::advisory(
            MEMORY,
            Requirement::Memory {
                min_bytes: mib(preflight.min_memory_mb.unwrap_or(DEFAULT_MIN_MEMORY_MIB)),
            },
        ),
        Check::blocking(
            BINARIES,
            Requirement::Binaries(
                ["apt-get", "dpkg-query", "systemctl"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
        ),
    ]
}

// ============================================================================
// Managed files
// ============================================================================

/// Compares a managed file against its rendered content.
pub fn file_detection(path: &Path, expected: &str) -> Detection {
    if files::file_matches(path, expected) {
        Detection::Satisfied(format!("{} is up to date", path.display()))
    } else if path.exists() {
        Detection::Drifted(format!("{} differs from the expected content", path.display()))
    } else {
        Detection::Missing
    }
}

pub fn file_verification(path: &Path, expected: &str) -> Verification {
    if files::file_matches(path, expected) {
        Verification::Passed
    } else {
        Verification::Failed(format!("{} does not hold the rendered content", path.display()))
    }
}

/// Writes a managed file, registering its undo action first.
///
/// Returns whether the content changed.
pub fn install_file(
    ctx: &mut StepContext<'_>,
    path: &Path,
    content: &str,
    mode: u32,
) -> Result<bool, StepError> {
    if !files::file_matches(path, content) {
        match files::backup_file(path)? {
            Some(backup) => ctx.on_cleanup(CleanupAction::RestoreFile {
                original: path.to_path_buf(),
                backup,
            }),
            None => ctx.on_cleanup(CleanupAction::RemoveFile(path.to_path_buf())),
        }
    }
    Ok(files::write_if_changed(path, content, mode)?)
}

// ============================================================================
// Services
// ============================================================================

/// Enables and (re)starts `unit`; stops it again on rollback if it was down.
pub async fn start_service(ctx: &mut StepContext<'_>, unit: &str) -> Result<(), StepError> {
    let was_active = systemd::is_active(ctx.runner(), unit).await?;
    systemd::daemon_reload(ctx.runner()).await?;
    systemd::enable(ctx.runner(), unit).await?;
    systemd::restart(ctx.runner(), unit).await?;
    if !was_active {
        ctx.on_cleanup(CleanupAction::StopService(unit.to_string()));
    }
    ctx.note(format!("{unit} enabled and started"));
    Ok(())
}

/// Restarts `unit` if it is running so it picks up a changed config.
pub async fn restart_if_active(ctx: &mut StepContext<'_>, unit: &str) -> Result<(), StepError> {
    if systemd::is_active(ctx.runner(), unit).await? {
        systemd::restart(ctx.runner(), unit).await?;
        ctx.note(format!("restarted {unit}"));
    }
    Ok(())
}

pub async fn verify_active(
    ctx: &StepContext<'_>,
    unit: &str,
    poll_delay: Duration,
) -> Result<Verification, StepError> {
    match systemd::wait_active(ctx.runner(), unit, SERVICE_POLLS, poll_delay).await? {
        UnitState::Active => Ok(Verification::Passed),
        state => Ok(Verification::Failed(format!("{unit} is {state}"))),
    }
}

async fn service_running(ctx: &StepContext<'_>, unit: &str) -> Result<Detection, StepError> {
    let enabled = systemd::is_enabled(ctx.runner(), unit).await?;
    let active = systemd::is_active(ctx.runner(), unit).await?;
    Ok(if enabled && active {
        Detection::Satisfied(format!("{unit} is enabled and running"))
    } else {
        Detection::Missing
    })
}

/// Enables and starts a systemd unit.
pub struct ServiceStep {
    id: &'static str,
    description: &'static str,
    unit: &'static str,
    poll_delay: Duration,
}

impl ServiceStep {
    pub fn new(id: &'static str, description: &'static str, unit: &'static str, poll_delay: Duration) -> Self {
        Self {
            id,
            description,
            unit,
            poll_delay,
        }
    }
}

#[async_trait]
impl Step for ServiceStep {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        self.description
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        service_running(ctx, self.unit).await
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        start_service(ctx, self.unit).await
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        verify_active(ctx, self.unit, self.poll_delay).await
    }
}

// ============================================================================
// Packages
// ============================================================================

/// Installs Debian packages that are not installed yet.
pub struct AptPackagesStep {
    id: &'static str,
    description: &'static str,
    packages: Vec<&'static str>,
}

impl AptPackagesStep {
    pub fn new(id: &'static str, description: &'static str, packages: &[&'static str]) -> Self {
        Self {
            id,
            description,
            packages: packages.to_vec(),
        }
    }
}

#[async_trait]
impl Step for AptPackagesStep {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        self.description
    }

    fn network_bound(&self) -> bool {
        true
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let missing = apt::missing_packages(ctx.runner(), &self.packages).await?;
        if missing.is_empty() {
            return Ok(Detection::Satisfied(format!(
                "all {} packages installed",
                self.packages.len()
            )));
        }
        tracing::debug!(step = self.id, ?missing, "packages missing");
        Ok(Detection::Missing)
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let missing = apt::missing_packages(ctx.runner(), &self.packages).await?;
        apt::update(ctx.runner()).await?;
        apt::install(ctx.runner(), &missing).await?;
        ctx.note(format!("installed {} packages: {}", missing.len(), missing.join(" ")));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        let missing = apt::missing_packages(ctx.runner(), &self.packages).await?;
        if missing.is_empty() {
            Ok(Verification::Passed)
        } else {
            Ok(Verification::Failed(format!("still missing: {}", missing.join(", "))))
        }
    }
}

// ============================================================================
// Source builds
// ============================================================================

/// Downloads a source tarball and runs the autotools build.
pub struct SourceBuildStep {
    pub id: &'static str,
    pub description: &'static str,
    pub name: &'static str,
    pub url: String,
    pub configure_args: Vec<&'static str>,
    pub binary: &'static str,
    /// Required substring of `<binary> -V`, e.g. a compiled-in feature.
    pub feature: Option<&'static str>,
    pub build_dir: PathBuf,
    /// Bound on the tarball download.
    pub download_timeout: Duration,
}

impl SourceBuildStep {
    async fn probe(&self, ctx: &StepContext<'_>) -> Result<Detection, StepError> {
        if !ctx.runner().exists(self.binary) {
            return Ok(Detection::Missing);
        }
        let Some(feature) = self.feature else {
            return Ok(Detection::Satisfied(format!("{} is installed", self.binary)));
        };

        let spec = piprov_command_runner::CommandSpec::new(self.binary).arg("-V");
        let output = ctx.run(&spec).await?;
        let version = format!("{}{}", output.stdout, output.stderr);
        let version = version.trim();
        if version.contains(feature) {
            Ok(Detection::Satisfied(format!("{} {version}", self.binary)))
        } else {
            Ok(Detection::Drifted(format!(
                "{} {version} lacks {feature} support",
                self.binary
            )))
        }
    }
}

#[async_trait]
impl Step for SourceBuildStep {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        self.description
    }

    fn network_bound(&self) -> bool {
        true
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        self.probe(ctx).await
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        ctx.on_cleanup(CleanupAction::RemoveDir(self.build_dir.join(self.name)));
        let source = Downloader::new(self.download_timeout)?
            .fetch_source(&self.url, &self.build_dir, self.name)
            .await?;
        download::build_autotools(
            ctx.runner(),
            &source,
            &self.configure_args,
            download::build_jobs(),
        )
        .await?;
        ctx.note(format!("built {} from {}", self.name, self.url));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        match self.probe(ctx).await? {
            Detection::Satisfied(_) => Ok(Verification::Passed),
            Detection::Missing => Ok(Verification::Failed(format!(
                "{} not found after install",
                self.binary
            ))),
            Detection::Drifted(reason) => Ok(Verification::Failed(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piprov_command_runner::test_utils::MockRunner;
    use piprov_preflight::Severity;

    #[test]
    fn test_preflight_checks_respect_overrides() {
        let mut config = Config::default();
        config.preflight.min_disk_mb = Some(4096);
        let checks = preflight_checks(&config, 1024, Path::new("/"));

        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec![ROOT, NETWORK, DISK_SPACE, MEMORY, BINARIES]);
        assert_eq!(
            checks[2].requirement,
            Requirement::DiskSpace {
                path: "/".into(),
                min_bytes: mib(4096)
            }
        );
        assert_eq!(checks[3].severity, Severity::Advisory);
    }

    #[tokio::test]
    async fn test_source_build_detects_missing_feature() {
        let runner = MockRunner::new();
        runner.on("shairport-sync -V", 0, "3.3.8-OpenSSL-Avahi-ALSA\n");
        let dir = tempfile::TempDir::new().unwrap();
        let mut store = piprov_state_store::StateStore::open(dir.path()).unwrap();
        let mut cleanup = Vec::new();
        let mut ctx = StepContext::new(&runner, &mut store, &mut cleanup);

        let step = SourceBuildStep {
            id: "shairport-sync",
            description: "build",
            name: "shairport-sync",
            url: "https://example.invalid/s.tar.gz".into(),
            configure_args: vec![],
            binary: "shairport-sync",
            feature: Some("AirPlay2"),
            build_dir: dir.path().join("build"),
            download_timeout: Duration::from_secs(5),
        };
        match step.detect(&mut ctx).await.unwrap() {
            Detection::Drifted(reason) => assert!(reason.contains("lacks AirPlay2")),
            other => panic!("unexpected detection: {other:?}"),
        }
    }
}
