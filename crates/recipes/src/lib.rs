//! The provisioning recipes: ordered steps, parameters and preflight checks
//! for each supported profile.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use piprov_cloudflare::{CloudflareApi, CloudflareClient, CloudflareError};
use piprov_collector::ParameterSpec;
use piprov_config::Config;
use piprov_preflight::Check;
use piprov_step_engine::Step;

pub mod airplay;
pub mod common;
pub mod wordpress;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("unknown profile '{0}' (expected one of: airplay, wordpress)")]
    UnknownProfile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Airplay,
    Wordpress,
}

impl Profile {
    pub const ALL: [Profile; 2] = [Profile::Airplay, Profile::Wordpress];

    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Airplay => "airplay",
            Profile::Wordpress => "wordpress",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Profile::Airplay => "AirPlay 2 receiver (shairport-sync + NQPTP)",
            Profile::Wordpress => "WordPress behind a Cloudflare Tunnel",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = RecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Profile::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RecipeError::UnknownProfile(s.to_string()))
    }
}

/// Builds a Cloudflare API handle from an API token.
pub type ApiFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn CloudflareApi>, CloudflareError> + Send + Sync>;

pub fn cloudflare_client_factory() -> ApiFactory {
    Arc::new(|token: &str| {
        let client = CloudflareClient::new(token)?;
        Ok(Arc::new(client) as Arc<dyn CloudflareApi>)
    })
}

/// Everything a recipe needs to know about the machine it provisions.
#[derive(Clone)]
pub struct RecipeContext {
    pub config: Config,
    /// Prefix for every system path the recipes write (`/` in production).
    pub root: PathBuf,
    pub cloudflare: ApiFactory,
    pub hostname: String,
    /// Delay between service state polls.
    pub poll_delay: Duration,
}

impl RecipeContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            root: PathBuf::from("/"),
            cloudflare: cloudflare_client_factory(),
            hostname: read_hostname(),
            poll_delay: Duration::from_secs(1),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_cloudflare(mut self, factory: ApiFactory) -> Self {
        self.cloudflare = factory;
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// `path` below [`RecipeContext::root`].
    pub fn path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

fn read_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "Raspberry Pi".to_string())
}

/// Ordered steps plus everything needed before and after running them.
pub struct Recipe {
    pub profile: Profile,
    pub steps: Vec<Box<dyn Step>>,
    pub parameters: Vec<ParameterSpec>,
    pub checks: Vec<Check>,
    /// Units included in the summary's service snapshot.
    pub services: Vec<&'static str>,
    /// Files the recipe manages, listed in the summary.
    pub files: Vec<PathBuf>,
}

impl Recipe {
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id()).collect()
    }
}

pub fn build(profile: Profile, ctx: &RecipeContext) -> Recipe {
    match profile {
        Profile::Airplay => airplay::recipe(ctx),
        Profile::Wordpress => wordpress::recipe(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parsing() {
        assert_eq!("airplay".parse::<Profile>().unwrap(), Profile::Airplay);
        assert_eq!(" WordPress ".parse::<Profile>().unwrap(), Profile::Wordpress);
        assert!("lamp".parse::<Profile>().is_err());
    }

    #[test]
    fn test_context_path_is_rooted() {
        let ctx = RecipeContext::new(Config::default()).with_root("/tmp/sysroot");
        assert_eq!(
            ctx.path("/etc/shairport-sync.conf"),
            PathBuf::from("/tmp/sysroot/etc/shairport-sync.conf")
        );
        let prod = RecipeContext::new(Config::default());
        assert_eq!(prod.path("/etc/cloudflared"), PathBuf::from("/etc/cloudflared"));
    }

    #[test]
    fn test_step_ids_are_unique() {
        let ctx = RecipeContext::new(Config::default()).with_hostname("pi");
        for profile in Profile::ALL {
            let recipe = build(profile, &ctx);
            let mut ids = recipe.step_ids();
            let total = ids.len();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), total, "{profile} has duplicate step ids");
        }
    }
}
