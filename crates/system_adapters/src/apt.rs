use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use piprov_command_runner::{Backoff, CommandRunner, CommandSpec};

use crate::AdapterError;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn network_backoff() -> Backoff {
    Backoff::Exponential {
        initial: Duration::from_secs(5),
        max: Duration::from_secs(60),
    }
}

/// Packages from `packages` that dpkg does not report as installed.
pub async fn missing_packages(
    runner: &dyn CommandRunner,
    packages: &[&str],
) -> Result<Vec<String>, AdapterError> {
    // Exit code 1 means some packages are unknown to dpkg.
    let spec = CommandSpec::new("dpkg-query")
        .args(["-W", "-f=${Package} ${Status}\\n"])
        .args(packages.iter().copied())
        .accept_exit_codes(&[0, 1]);
    let output = runner.run(&spec).await?;
    let installed = parse_installed(&output.stdout);
    Ok(packages
        .iter()
        .filter(|p| !installed.contains(**p))
        .map(|p| p.to_string())
        .collect())
}

/// Names from `dpkg-query -W -f='${Package} ${Status}\n'` output whose
/// status is `install ok installed`.
pub fn parse_installed(stdout: &str) -> HashSet<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, status) = line.trim().split_once(' ')?;
            (status.trim() == "install ok installed").then(|| name.to_string())
        })
        .collect()
}

pub async fn update(runner: &dyn CommandRunner) -> Result<(), AdapterError> {
    let spec = CommandSpec::new("apt-get")
        .args(["update", "-q"])
        .env("DEBIAN_FRONTEND", "noninteractive")
        .timeout(INSTALL_TIMEOUT)
        .retries(2, network_backoff());
    runner.run(&spec).await?;
    Ok(())
}

pub async fn install(runner: &dyn CommandRunner, packages: &[String]) -> Result<(), AdapterError> {
    if packages.is_empty() {
        return Ok(());
    }
    let spec = CommandSpec::new("apt-get")
        .args(["install", "-y", "-q", "--no-install-recommends"])
        .args(packages.iter().cloned())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .timeout(INSTALL_TIMEOUT)
        .retries(2, network_backoff())
        .named(format!("apt-get install ({} packages)", packages.len()));
    runner.run(&spec).await?;
    Ok(())
}

/// Installs a local `.deb`, letting apt resolve its dependencies.
pub async fn install_deb(runner: &dyn CommandRunner, path: &Path) -> Result<(), AdapterError> {
    let spec = CommandSpec::new("apt-get")
        .args(["install", "-y", "-q"])
        .arg(path.display().to_string())
        .env("DEBIAN_FRONTEND", "noninteractive")
        .timeout(INSTALL_TIMEOUT);
    runner.run(&spec).await?;
    Ok(())
}

/// Debian architecture name (`arm64`, `armhf`, `amd64`).
pub async fn architecture(runner: &dyn CommandRunner) -> Result<String, AdapterError> {
    let output = runner
        .run(&CommandSpec::new("dpkg").arg("--print-architecture"))
        .await?;
    let arch = output.stdout_trimmed();
    if arch.is_empty() {
        return Err(AdapterError::Parse {
            tool: "dpkg",
            message: "empty architecture".to_string(),
        });
    }
    Ok(arch.to_string())
}
