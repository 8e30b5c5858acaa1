use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub const ROOT: &str = "root";
pub const NETWORK: &str = "network";
pub const DISK_SPACE: &str = "disk-space";
pub const MEMORY: &str = "memory";
pub const BINARIES: &str = "binaries";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("preflight failed: {}", names(.0))]
    PreconditionFailed(Vec<CheckOutcome>),
}

fn names(outcomes: &[CheckOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("{} ({})", o.name, o.message))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Checks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Effective uid 0.
    Root,
    /// At least one `host:port` accepts a TCP connection.
    Network {
        targets: Vec<String>,
        timeout: Duration,
        attempts: u32,
        delay: Duration,
    },
    DiskSpace { path: PathBuf, min_bytes: u64 },
    Memory { min_bytes: u64 },
    Binaries(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Failure lands in `failed` and stops the run unless overridden.
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub requirement: Requirement,
    pub severity: Severity,
}

impl Check {
    pub fn blocking(name: &str, requirement: Requirement) -> Self {
        Self {
            name: name.to_string(),
            requirement,
            severity: Severity::Blocking,
        }
    }

    pub fn advisory(name: &str, requirement: Requirement) -> Self {
        Self {
            name: name.to_string(),
            requirement,
            severity: Severity::Advisory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub message: String,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub passed: Vec<CheckOutcome>,
    pub failed: Vec<CheckOutcome>,
    pub warnings: Vec<CheckOutcome>,
}

impl PreflightReport {
    pub fn is_clear(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// SystemProbe Trait - host capabilities, mockable for tests
// ============================================================================

#[async_trait]
pub trait SystemProbe: Send + Sync {
    fn effective_uid(&self) -> u32;

    async fn can_connect(&self, target: &str, timeout: Duration) -> bool;

    /// Bytes available to unprivileged users on the filesystem holding `path`.
    fn available_disk(&self, path: &Path) -> io::Result<u64>;

    fn available_memory(&self) -> io::Result<u64>;

    fn has_binary(&self, name: &str) -> bool;

    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Probes the machine this process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

#[async_trait]
impl SystemProbe for HostProbe {
    fn effective_uid(&self) -> u32 {
        nix::unistd::geteuid().as_raw()
    }

    async fn can_connect(&self, target: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(addr = target, "connect failed: {e}");
                false
            }
            Err(_) => {
                tracing::debug!(addr = target, "connect timed out");
                false
            }
        }
    }

    fn available_disk(&self, path: &Path) -> io::Result<u64> {
        // The target directory may not exist yet; measure its nearest ancestor.
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("/"));
        let stat = nix::sys::statvfs::statvfs(existing).map_err(io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(bytes)
    }

    fn available_memory(&self) -> io::Result<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")?;
        parse_meminfo(&meminfo).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no MemAvailable in /proc/meminfo")
        })
    }

    fn has_binary(&self, name: &str) -> bool {
        which::which(name).is_ok()
    }
}

/// Available memory in bytes; `MemAvailable`, falling back to `MemFree`
/// on old kernels.
pub fn parse_meminfo(content: &str) -> Option<u64> {
    let field = |key: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(key)?.strip_prefix(':')?;
            let kb = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
            Some(kb * 1024)
        })
    };
    field("MemAvailable").or_else(|| field("MemFree"))
}

// ============================================================================
// Running and gating
// ============================================================================

pub async fn run_preflight(probe: &dyn SystemProbe, checks: &[Check]) -> PreflightReport {
    let mut report = PreflightReport::default();

    for check in checks {
        let result = evaluate(probe, &check.requirement).await;
        match result {
            Ok(message) => {
                tracing::debug!(check = %check.name, "passed: {message}");
                report.passed.push(CheckOutcome {
                    name: check.name.clone(),
                    message,
                });
            }
            Err(message) => {
                tracing::debug!(check = %check.name, severity = ?check.severity, "failed: {message}");
                let outcome = CheckOutcome {
                    name: check.name.clone(),
                    message,
                };
                match check.severity {
                    Severity::Blocking => report.failed.push(outcome),
                    Severity::Advisory => report.warnings.push(outcome),
                }
            }
        }
    }

    report
}

async fn evaluate(probe: &dyn SystemProbe, requirement: &Requirement) -> Result<String, String> {
    match requirement {
        Requirement::Root => {
            let uid = probe.effective_uid();
            if uid == 0 {
                Ok("running as root".to_string())
            } else {
                Err(format!("must run as root (effective uid {uid}); try sudo"))
            }
        }
        Requirement::Network {
            targets,
            timeout,
            attempts,
            delay,
        } => {
            let attempts = (*attempts).max(1);
            for attempt in 1..=attempts {
                for target in targets {
                    if probe.can_connect(target, *timeout).await {
                        return Ok(format!("reachable via {target}"));
                    }
                }
                if attempt < attempts {
                    tracing::debug!("network probe round {attempt}/{attempts} failed");
                    probe.pause(*delay).await;
                }
            }
            Err(format!(
                "none of {} reachable after {attempts} attempts",
                targets.join(", ")
            ))
        }
        Requirement::DiskSpace { path, min_bytes } => match probe.available_disk(path) {
            Ok(free) if free >= *min_bytes => Ok(format!(
                "{} MiB free on {}",
                free / MIB,
                path.display()
            )),
            Ok(free) => Err(format!(
                "{} MiB free on {}, need {} MiB",
                free / MIB,
                path.display(),
                min_bytes / MIB
            )),
            Err(e) => Err(format!("cannot stat {}: {e}", path.display())),
        },
        Requirement::Memory { min_bytes } => match probe.available_memory() {
            Ok(free) if free >= *min_bytes => Ok(format!("{} MiB available", free / MIB)),
            Ok(free) => Err(format!(
                "{} MiB memory available, recommended {} MiB",
                free / MIB,
                min_bytes / MIB
            )),
            Err(e) => Err(format!("cannot read memory information: {e}")),
        },
        Requirement::Binaries(binaries) => {
            let missing: Vec<&str> = binaries
                .iter()
                .map(String::as_str)
                .filter(|b| !probe.has_binary(b))
                .collect();
            if missing.is_empty() {
                Ok(format!("found {}", binaries.join(", ")))
            } else {
                Err(format!("missing {}", missing.join(", ")))
            }
        }
    }
}

/// Lets the run proceed only if every failed check is overridden by
/// `confirm`. Overridden checks are moved to `warnings`.
pub fn gate<F>(mut report: PreflightReport, mut confirm: F) -> Result<PreflightReport, PreflightError>
where
    F: FnMut(&CheckOutcome) -> bool,
{
    let mut refused = Vec::new();

    for outcome in std::mem::take(&mut report.failed) {
        if confirm(&outcome) {
            tracing::warn!(check = %outcome.name, "preflight failure overridden");
            report.warnings.push(CheckOutcome {
                message: format!("{} (overridden)", outcome.message),
                name: outcome.name,
            });
        } else {
            refused.push(outcome);
        }
    }

    if refused.is_empty() {
        Ok(report)
    } else {
        Err(PreflightError::PreconditionFailed(refused))
    }
}

/// Convenience constructor for a megabyte threshold.
pub fn mib(megabytes: u64) -> u64 {
    megabytes * MIB
}

// ============================================================================
// Test Utilities
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Probe with fixed answers. Defaults describe a healthy host.
    pub struct MockProbe {
        pub uid: u32,
        pub reachable: HashSet<String>,
        pub disk_bytes: u64,
        pub memory_bytes: u64,
        pub binaries: Option<HashSet<String>>,
        connects: Mutex<Vec<String>>,
        pauses: Mutex<usize>,
    }

    impl Default for MockProbe {
        fn default() -> Self {
            Self {
                uid: 0,
                reachable: HashSet::from(["1.1.1.1:443".to_string()]),
                disk_bytes: mib(16 * 1024),
                memory_bytes: mib(1024),
                binaries: None,
                connects: Mutex::new(Vec::new()),
                pauses: Mutex::new(0),
            }
        }
    }

    impl MockProbe {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_uid(mut self, uid: u32) -> Self {
            self.uid = uid;
            self
        }

        pub fn offline(mut self) -> Self {
            self.reachable.clear();
            self
        }

        pub fn with_disk_mib(mut self, mb: u64) -> Self {
            self.disk_bytes = mib(mb);
            self
        }

        pub fn with_memory_mib(mut self, mb: u64) -> Self {
            self.memory_bytes = mib(mb);
            self
        }

        /// Only these binaries exist.
        pub fn with_binaries(mut self, names: &[&str]) -> Self {
            self.binaries = Some(names.iter().map(|s| s.to_string()).collect());
            self
        }

        pub fn connects(&self) -> Vec<String> {
            self.connects.lock().unwrap().clone()
        }

        pub fn pauses(&self) -> usize {
            *self.pauses.lock().unwrap()
        }
    }

    #[async_trait]
    impl SystemProbe for MockProbe {
        fn effective_uid(&self) -> u32 {
            self.uid
        }

        async fn can_connect(&self, target: &str, _timeout: Duration) -> bool {
            self.connects.lock().unwrap().push(target.to_string());
            self.reachable.contains(target)
        }

        fn available_disk(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.disk_bytes)
        }

        fn available_memory(&self) -> io::Result<u64> {
            Ok(self.memory_bytes)
        }

        fn has_binary(&self, name: &str) -> bool {
            self.binaries.as_ref().map_or(true, |set| set.contains(name))
        }

        async fn pause(&self, _delay: Duration) {
            *self.pauses.lock().unwrap() += 1;
        }
    }
}
