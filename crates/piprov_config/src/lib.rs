use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".piprov.toml";

/// System-wide config file, used when no local file exists.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/piprov/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub runner: RunnerConfig,
    pub preflight: PreflightConfig,
    pub engine: EngineConfig,
    pub airplay: AirplayConfig,
    pub wordpress: WordpressConfig,
    /// Preset parameter values, used instead of prompting.
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for per-profile state, run log and summary.
    pub state_dir: PathBuf,
    /// Scratch directory for downloads and source builds.
    pub build_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/piprov"),
            build_dir: PathBuf::from("/var/cache/piprov/build"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_ms: u64,
    pub exponential_backoff: bool,
    pub max_backoff_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            retries: 2,
            backoff_ms: 2000,
            exponential_backoff: true,
            max_backoff_ms: 30_000,
        }
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// `host:port` targets, tried in order.
    pub probe_targets: Vec<String>,
    pub probe_timeout_secs: u64,
    pub probe_attempts: u32,
    pub probe_delay_ms: u64,
    /// Overrides the profile's disk requirement.
    pub min_disk_mb: Option<u64>,
    /// Overrides the profile's memory recommendation.
    pub min_memory_mb: Option<u64>,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            probe_targets: vec![
                "1.1.1.1:443".to_string(),
                "8.8.8.8:53".to_string(),
                "deb.debian.org:80".to_string(),
            ],
            probe_timeout_secs: 5,
            probe_attempts: 3,
            probe_delay_ms: 1000,
            min_disk_mb: None,
            min_memory_mb: None,
        }
    }
}

impl PreflightConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts for steps that talk to the network (downloads, API calls).
    pub network_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AirplayConfig {
    pub shairport_sync_version: String,
    pub nqptp_version: String,
    /// Mixer volume applied to the chosen output, in percent.
    pub volume_percent: u8,
}

impl Default for AirplayConfig {
    fn default() -> Self {
        Self {
            shairport_sync_version: "4.3.4".to_string(),
            nqptp_version: "1.2.4".to_string(),
            volume_percent: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WordpressConfig {
    pub web_root: PathBuf,
    pub download_url: String,
    /// Where `cloudflared-linux-<arch>.deb` is fetched from.
    pub cloudflared_release_url: String,
    /// Tunnel name; defaults to `piprov-` plus the domain with dots as dashes.
    pub tunnel_name: Option<String>,
    /// Origin the tunnel forwards to.
    pub local_service: String,
}

impl Default for WordpressConfig {
    fn default() -> Self {
        Self {
            web_root: PathBuf::from("/var/www/wordpress"),
            download_url: "https://wordpress.org/latest.tar.gz".to_string(),
            cloudflared_release_url:
                "https://github.com/cloudflare/cloudflared/releases/latest/download".to_string(),
            tunnel_name: None,
            local_service: "http://localhost:80".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    /// Resolves the config to use: an explicit path must exist, otherwise the
    /// local file, then the system file, then built-in defaults.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        let local = cwd.join(CONFIG_FILE_NAME);
        if local.exists() {
            return Ok((Self::load(&local)?, Some(local)));
        }

        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Ok((Self::load(&system)?, Some(system)));
        }

        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preflight.probe_targets.is_empty() {
            return Err(ConfigError::Invalid("preflight.probe_targets must not be empty".into()));
        }
        if let Some(bad) = self.preflight.probe_targets.iter().find(|t| !t.contains(':')) {
            return Err(ConfigError::Invalid(format!(
                "preflight.probe_targets entry '{bad}' must be host:port"
            )));
        }
        if self.preflight.probe_attempts == 0 {
            return Err(ConfigError::Invalid("preflight.probe_attempts must be at least 1".into()));
        }
        if self.engine.network_attempts == 0 {
            return Err(ConfigError::Invalid("engine.network_attempts must be at least 1".into()));
        }
        if self.runner.timeout_secs == 0 {
            return Err(ConfigError::Invalid("runner.timeout_secs must be at least 1".into()));
        }
        if self.airplay.volume_percent > 100 {
            return Err(ConfigError::Invalid("airplay.volume_percent must be 0-100".into()));
        }
        Ok(())
    }

    /// State directory for one profile.
    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.paths.state_dir.join(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.paths.state_dir, PathBuf::from("/var/lib/piprov"));
        assert_eq!(config.runner.retries, 2);
        assert_eq!(config.engine.network_attempts, 3);
        assert_eq!(config.preflight.probe_targets.len(), 3);
        assert!(config.parameters.is_empty());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config: Config = toml::from_str(
            r#"
[paths]
state_dir = "/tmp/piprov"

[runner]
retries = 5

[parameters]
domain = "example.com"
"#,
        )
        .unwrap();

        assert_eq!(config.paths.state_dir, PathBuf::from("/tmp/piprov"));
        assert_eq!(config.paths.build_dir, PathBuf::from("/var/cache/piprov/build"));
        assert_eq!(config.runner.retries, 5);
        assert_eq!(config.runner.timeout_secs, 600);
        assert_eq!(config.parameters.get("domain").map(String::as_str), Some("example.com"));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[airplay]\nvolume_percent = 60\n").unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.airplay.volume_percent, 60);
        assert_eq!(config.airplay.nqptp_version, "1.2.4");
    }

    #[test]
    fn test_invalid_probe_target_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[preflight]\nprobe_targets = [\"example.com\"]\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runner\nretries = ").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_discover_explicit_missing_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = Config::discover(Some(&missing), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_discover_prefers_local_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[engine]\nnetwork_attempts = 7\n").unwrap();

        let (config, source) = Config::discover(None, dir.path()).unwrap();
        assert_eq!(config.engine.network_attempts, 7);
        assert_eq!(source, Some(dir.path().join(CONFIG_FILE_NAME)));
    }

    #[test]
    fn test_profile_dir() {
        let config = Config::default();
        assert_eq!(config.profile_dir("airplay"), PathBuf::from("/var/lib/piprov/airplay"));
    }
}
