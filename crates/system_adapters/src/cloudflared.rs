use piprov_command_runner::{tolerate, CommandRunner, CommandSpec, RunnerError};

use crate::AdapterError;

pub const SERVICE: &str = "cloudflared";
pub const CONFIG_DIR: &str = "/etc/cloudflared";

pub const RELEASE_URL: &str = "https://github.com/cloudflare/cloudflared/releases/latest/download";

/// Package URL below `release_url` for a Debian architecture (`arm64`,
/// `armhf`, `amd64`).
pub fn deb_url(release_url: &str, arch: &str) -> String {
    format!("{}/cloudflared-linux-{arch}.deb", release_url.trim_end_matches('/'))
}

/// Extracts `2024.6.1` from `cloudflared version 2024.6.1 (built 2024-06-12)`.
pub fn parse_version(stdout: &str) -> Option<String> {
    let rest = stdout.trim().strip_prefix("cloudflared version ")?;
    rest.split_whitespace().next().map(str::to_string)
}

/// Installed version, or `None` when the binary is absent.
pub async fn version(runner: &dyn CommandRunner) -> Result<Option<String>, AdapterError> {
    if !runner.exists("cloudflared") {
        return Ok(None);
    }
    match runner
        .run(&CommandSpec::new("cloudflared").arg("--version"))
        .await
    {
        Ok(output) => Ok(parse_version(&output.stdout)),
        Err(RunnerError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Registers the systemd unit; an existing installation is not an error.
pub async fn service_install(runner: &dyn CommandRunner) -> Result<(), AdapterError> {
    let result = runner
        .run(&CommandSpec::new("cloudflared").args(["service", "install"]))
        .await;
    tolerate(result, |output| {
        let text = format!("{}{}", output.stdout, output.stderr).to_ascii_lowercase();
        text.contains("already installed") || text.contains("already exists")
    })?;
    Ok(())
}
