//! WordPress on Apache + MariaDB, published through a Cloudflare Tunnel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use piprov_cloudflare::{
    generate_tunnel_secret, plan_record_change, CloudflareApi, CloudflareError, RecordChange,
    RecordOutcome, TunnelCredentials,
};
use piprov_collector::{
    generate_password, Normalizer, ParameterSpec, Validator, ValueVerifier,
};
use piprov_command_runner::CommandSpec;
use piprov_step_engine::{CleanupAction, Detection, Step, StepContext, StepError, Verification};
use piprov_system_adapters::download::Downloader;
use piprov_system_adapters::{apt, cloudflared, files, mysql, systemd};

use crate::common::{
    file_detection, file_verification, install_file, preflight_checks, restart_if_active,
    start_service, verify_active, AptPackagesStep,
};
use crate::{ApiFactory, Profile, Recipe, RecipeContext};

pub const DOMAIN: &str = "domain";
pub const API_TOKEN: &str = "cloudflare_api_token";
pub const DB_NAME: &str = "db_name";
pub const DB_USER: &str = "db_user";
pub const DB_PASSWORD: &str = "db_password";

pub const ZONE_ID: &str = "zone_id";
pub const ACCOUNT_ID: &str = "account_id";
pub const TUNNEL_ID: &str = "tunnel_id";
pub const TUNNEL_SECRET: &str = "tunnel_secret";
const SALTS: &str = "wp_salts";

pub const APACHE_SERVICE: &str = "apache2";
pub const MARIADB_SERVICE: &str = "mariadb";

const MIN_DISK_MIB: u64 = 2048;
const PASSWORD_LEN: usize = 24;
const SALT_LEN: usize = 64;
const WEB_OWNER: &str = "www-data:www-data";

pub const LAMP_PACKAGES: &[&str] = &[
    "apache2",
    "mariadb-server",
    "mariadb-client",
    "php",
    "libapache2-mod-php",
    "php-mysql",
    "php-curl",
    "php-gd",
    "php-mbstring",
    "php-xml",
    "php-zip",
    "php-intl",
];

const SALT_KEYS: &[&str] = &[
    "AUTH_KEY",
    "SECURE_AUTH_KEY",
    "LOGGED_IN_KEY",
    "NONCE_KEY",
    "AUTH_SALT",
    "SECURE_AUTH_SALT",
    "LOGGED_IN_SALT",
    "NONCE_SALT",
];

fn generated_password() -> String {
    generate_password(PASSWORD_LEN)
}

pub fn recipe(ctx: &RecipeContext) -> Recipe {
    let config = &ctx.config;
    let web_root = ctx.path(&config.wordpress.web_root);
    let cloudflared_dir = ctx.path(cloudflared::CONFIG_DIR);
    let site = ApacheSite::new(ctx);
    let tunnel_config = cloudflared_dir.join("config.yml");

    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(AptPackagesStep::new(
            "lamp-packages",
            "Install Apache, MariaDB and PHP",
            LAMP_PACKAGES,
        )),
        Box::new(DatabaseStep),
        Box::new(WordpressFilesStep {
            web_root: web_root.clone(),
            url: config.wordpress.download_url.clone(),
            build_dir: config.paths.build_dir.clone(),
            download_timeout: config.runner.timeout(),
        }),
        Box::new(WpConfigStep {
            path: web_root.join("wp-config.php"),
        }),
        Box::new(ApacheSiteStep {
            site: site.clone(),
            poll_delay: ctx.poll_delay,
        }),
        Box::new(CloudflaredStep {
            release_url: config.wordpress.cloudflared_release_url.clone(),
            build_dir: config.paths.build_dir.clone(),
            download_timeout: config.runner.timeout(),
        }),
        Box::new(TunnelStep {
            api: ctx.cloudflare.clone(),
            tunnel_name: config.wordpress.tunnel_name.clone(),
            local_service: config.wordpress.local_service.clone(),
            config_dir: cloudflared_dir,
        }),
        Box::new(DnsRouteStep {
            api: ctx.cloudflare.clone(),
        }),
        Box::new(CloudflaredServiceStep {
            poll_delay: ctx.poll_delay,
        }),
    ];

    Recipe {
        profile: Profile::Wordpress,
        steps,
        parameters: parameters(ctx),
        checks: preflight_checks(config, MIN_DISK_MIB, &ctx.path("/")),
        services: vec![APACHE_SERVICE, MARIADB_SERVICE, cloudflared::SERVICE],
        files: vec![web_root.join("wp-config.php"), site.available, tunnel_config],
    }
}

pub fn parameters(ctx: &RecipeContext) -> Vec<ParameterSpec> {
    vec![
        ParameterSpec::new(DOMAIN, "Domain for the site (e.g. blog.example.com)")
            .normalizer(Normalizer::Domain)
            .validator(Validator::Domain),
        ParameterSpec::new(API_TOKEN, "Cloudflare API token")
            .sensitive()
            .verifier(Arc::new(TokenVerifier {
                api: ctx.cloudflare.clone(),
            })),
        ParameterSpec::new(DB_NAME, "Database name")
            .default_value("wordpress")
            .validator(Validator::Identifier),
        ParameterSpec::new(DB_USER, "Database user")
            .default_value("wordpress")
            .validator(Validator::Identifier),
        ParameterSpec::new(DB_PASSWORD, "Database password")
            .sensitive()
            .generated(generated_password)
            .validator(Validator::MinLength(12)),
    ]
}

/// Checks an API token against Cloudflare before it is accepted.
pub struct TokenVerifier {
    api: ApiFactory,
}

#[async_trait]
impl ValueVerifier for TokenVerifier {
    async fn verify(&self, token: &str) -> Result<(), String> {
        let api = (self.api)(token).map_err(|e| e.to_string())?;
        let status = api.verify_token().await.map_err(|e| e.to_string())?;
        if status.is_active() {
            Ok(())
        } else {
            Err(format!("token status is '{}'", status.status))
        }
    }
}

// ============================================================================
// Database
// ============================================================================

struct DbSettings {
    name: String,
    user: String,
    password: String,
}

impl DbSettings {
    fn from_state(ctx: &StepContext<'_>) -> Result<Self, StepError> {
        Ok(Self {
            name: ctx.require_config(DB_NAME)?,
            user: ctx.require_config(DB_USER)?,
            password: ctx.require_config(DB_PASSWORD)?,
        })
    }
}

/// Creates the WordPress database and user.
pub struct DatabaseStep;

#[async_trait]
impl Step for DatabaseStep {
    fn id(&self) -> &str {
        "database"
    }

    fn description(&self) -> &str {
        "Create the WordPress database and user"
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let db = DbSettings::from_state(ctx)?;
        let runner = ctx.runner();
        if !mysql::database_exists(runner, &db.name).await? || !mysql::user_exists(runner, &db.user).await? {
            return Ok(Detection::Missing);
        }
        if mysql::can_login(runner, &db.name, &db.user, &db.password).await? {
            Ok(Detection::Satisfied(format!(
                "database {} and user {} exist",
                db.name, db.user
            )))
        } else {
            Ok(Detection::Drifted(format!("user {} cannot log in", db.user)))
        }
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let db = DbSettings::from_state(ctx)?;
        mysql::provision(ctx.runner(), &db.name, &db.user, &db.password).await?;
        ctx.note(format!("database {} owned by {}", db.name, db.user));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        let db = DbSettings::from_state(ctx)?;
        if mysql::can_login(ctx.runner(), &db.name, &db.user, &db.password).await? {
            Ok(Verification::Passed)
        } else {
            Ok(Verification::Failed(format!(
                "user {} cannot open database {}",
                db.user, db.name
            )))
        }
    }
}

// ============================================================================
// WordPress files and configuration
// ============================================================================

/// Reads `$wp_version` from `wp-includes/version.php`.
pub fn installed_version(web_root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(web_root.join("wp-includes/version.php")).ok()?;
    content.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("$wp_version")?;
        let start = rest.find('\'')? + 1;
        let end = start + rest[start..].find('\'')?;
        Some(rest[start..end].to_string())
    })
}

/// Moves every entry of `from` into `to`, keeping entries `to` already has.
fn merge_into(from: &Path, to: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(to)?;
    let mut moved = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if target.exists() {
            continue;
        }
        std::fs::rename(entry.path(), target)?;
        moved += 1;
    }
    Ok(moved)
}

/// Downloads the WordPress release into the web root.
pub struct WordpressFilesStep {
    web_root: PathBuf,
    url: String,
    build_dir: PathBuf,
    download_timeout: Duration,
}

#[async_trait]
impl Step for WordpressFilesStep {
    fn id(&self) -> &str {
        "wordpress-files"
    }

    fn description(&self) -> &str {
        "Download WordPress into the web root"
    }

    fn network_bound(&self) -> bool {
        true
    }

    async fn detect(&self, _ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        Ok(match installed_version(&self.web_root) {
            Some(version) => Detection::Satisfied(format!("WordPress {version} present")),
            None => Detection::Missing,
        })
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        if !self.web_root.exists() {
            ctx.on_cleanup(CleanupAction::RemoveDir(self.web_root.clone()));
        }
        let source = Downloader::new(self.download_timeout)?
            .fetch_source(&self.url, &self.build_dir, "wordpress")
            .await?;
        let moved = merge_into(&source, &self.web_root)?;
        tokio::fs::remove_dir_all(self.build_dir.join("wordpress")).await.ok();

        files::chown(ctx.runner(), &self.web_root, WEB_OWNER, true).await?;
        ctx.note(format!("unpacked {moved} entries into {}", self.web_root.display()));
        Ok(())
    }

    async fn verify(&self, _ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        Ok(match installed_version(&self.web_root) {
            Some(_) => Verification::Passed,
            None => Verification::Failed("wp-includes/version.php is missing".to_string()),
        })
    }
}

fn php_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Settings rendered into `wp-config.php`.
pub struct WpConfig<'a> {
    pub db_name: &'a str,
    pub db_user: &'a str,
    pub db_password: &'a str,
    pub domain: &'a str,
    pub salts: &'a [String],
}

pub fn render_wp_config(cfg: &WpConfig<'_>) -> String {
    let mut out = String::from("<?php\n// Managed by piprov; local changes are overwritten.\n\n");
    for (key, value) in [
        ("DB_NAME", cfg.db_name),
        ("DB_USER", cfg.db_user),
        ("DB_PASSWORD", cfg.db_password),
        ("DB_HOST", "localhost"),
        ("DB_CHARSET", "utf8mb4"),
        ("DB_COLLATE", ""),
    ] {
        out.push_str(&format!("define( '{key}', {} );\n", php_quote(value)));
    }
    out.push('\n');
    for (key, salt) in SALT_KEYS.iter().zip(cfg.salts) {
        out.push_str(&format!("define( '{key}', {} );\n", php_quote(salt)));
    }

    let url = php_quote(&format!("https://{}", cfg.domain));
    out.push_str(&format!(
        "\n$table_prefix = 'wp_';\n\n\
         define( 'WP_HOME', {url} );\n\
         define( 'WP_SITEURL', {url} );\n\n\
         // TLS ends at the Cloudflare edge; trust the forwarded protocol.\n\
         if ( isset( $_SERVER['HTTP_X_FORWARDED_PROTO'] ) && 'https' === $_SERVER['HTTP_X_FORWARDED_PROTO'] ) {{\n\
         \t$_SERVER['HTTPS'] = 'on';\n\
         }}\n\n\
         define( 'WP_DEBUG', false );\n\n\
         if ( ! defined( 'ABSPATH' ) ) {{\n\
         \tdefine( 'ABSPATH', __DIR__ . '/' );\n\
         }}\n\n\
         require_once ABSPATH . 'wp-settings.php';\n"
    ));
    out
}

/// Writes `wp-config.php` with database credentials and local salts.
pub struct WpConfigStep {
    path: PathBuf,
}

impl WpConfigStep {
    fn render(&self, ctx: &StepContext<'_>, salts: &[String]) -> Result<String, StepError> {
        let db = DbSettings::from_state(ctx)?;
        let domain = ctx.require_config(DOMAIN)?;
        Ok(render_wp_config(&WpConfig {
            db_name: &db.name,
            db_user: &db.user,
            db_password: &db.password,
            domain: &domain,
            salts,
        }))
    }

    fn stored_salts(ctx: &StepContext<'_>) -> Option<Vec<String>> {
        let salts: Vec<String> = ctx.config(SALTS)?.lines().map(str::to_string).collect();
        (salts.len() == SALT_KEYS.len()).then_some(salts)
    }
}

#[async_trait]
impl Step for WpConfigStep {
    fn id(&self) -> &str {
        "wp-config"
    }

    fn description(&self) -> &str {
        "Write wp-config.php"
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let Some(salts) = Self::stored_salts(ctx) else {
            return Ok(if self.path.exists() {
                Detection::Drifted("wp-config.php was not written by piprov".to_string())
            } else {
                Detection::Missing
            });
        };
        let rendered = self.render(ctx, &salts)?;
        Ok(file_detection(&self.path, &rendered))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let salts = match Self::stored_salts(ctx) {
            Some(salts) => salts,
            None => {
                let salts: Vec<String> = SALT_KEYS.iter().map(|_| generate_password(SALT_LEN)).collect();
                ctx.remember(SALTS, &salts.join("\n"), true)?;
                salts
            }
        };
        let rendered = self.render(ctx, &salts)?;
        install_file(ctx, &self.path, &rendered, 0o640)?;
        files::chown(ctx.runner(), &self.path, "root:www-data", false).await?;
        ctx.note(format!("wrote {}", self.path.display()));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        let salts = Self::stored_salts(ctx).unwrap_or_default();
        let rendered = self.render(ctx, &salts)?;
        Ok(file_verification(&self.path, &rendered))
    }
}

// ============================================================================
// Apache
// ============================================================================

#[derive(Debug, Clone)]
struct ApacheSite {
    available: PathBuf,
    enabled: PathBuf,
    default_enabled: PathBuf,
    web_root: PathBuf,
}

impl ApacheSite {
    fn new(ctx: &RecipeContext) -> Self {
        Self {
            available: ctx.path("/etc/apache2/sites-available/wordpress.conf"),
            enabled: ctx.path("/etc/apache2/sites-enabled/wordpress.conf"),
            default_enabled: ctx.path("/etc/apache2/sites-enabled/000-default.conf"),
            web_root: ctx.config.wordpress.web_root.clone(),
        }
    }
}

pub fn render_vhost(domain: &str, web_root: &Path) -> String {
    let root = web_root.display();
    format!(
        "# Managed by piprov; local changes are overwritten.\n\
         <VirtualHost *:80>\n\
         \x20   ServerName {domain}\n\
         \x20   DocumentRoot {root}\n\
         \n\
         \x20   <Directory {root}>\n\
         \x20       Options FollowSymLinks\n\
         \x20       AllowOverride All\n\
         \x20       Require all granted\n\
         \x20   </Directory>\n\
         \n\
         \x20   ErrorLog ${{APACHE_LOG_DIR}}/wordpress-error.log\n\
         \x20   CustomLog ${{APACHE_LOG_DIR}}/wordpress-access.log combined\n\
         </VirtualHost>\n"
    )
}

/// Configures the Apache virtual host serving WordPress.
struct ApacheSiteStep {
    site: ApacheSite,
    poll_delay: Duration,
}

impl ApacheSiteStep {
    fn render(&self, ctx: &StepContext<'_>) -> Result<String, StepError> {
        Ok(render_vhost(&ctx.require_config(DOMAIN)?, &self.site.web_root))
    }
}

#[async_trait]
impl Step for ApacheSiteStep {
    fn id(&self) -> &str {
        "apache-site"
    }

    fn description(&self) -> &str {
        "Configure and enable the Apache site"
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let rendered = self.render(ctx)?;
        match file_detection(&self.site.available, &rendered) {
            Detection::Satisfied(detail) => {
                if !self.site.enabled.exists() {
                    Ok(Detection::Drifted("site is not enabled".to_string()))
                } else if self.site.default_enabled.exists() {
                    Ok(Detection::Drifted("default site is still enabled".to_string()))
                } else {
                    Ok(Detection::Satisfied(detail))
                }
            }
            other => Ok(other),
        }
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let rendered = self.render(ctx)?;
        install_file(ctx, &self.site.available, &rendered, 0o644)?;

        let runner = ctx.runner();
        runner.run(&CommandSpec::new("a2enmod").arg("rewrite")).await?;
        runner.run(&CommandSpec::new("a2ensite").arg("wordpress")).await?;
        runner
            .run(&CommandSpec::new("a2dissite").arg("000-default").accept_exit_codes(&[0, 1]))
            .await?;
        runner.run(&CommandSpec::new("apache2ctl").arg("configtest")).await?;
        systemd::restart(runner, APACHE_SERVICE).await?;

        ctx.note("site enabled, apache restarted");
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        verify_active(ctx, APACHE_SERVICE, self.poll_delay).await
    }
}

// ============================================================================
// Cloudflare Tunnel
// ============================================================================

/// Installs the `cloudflared` package for this architecture.
pub struct CloudflaredStep {
    release_url: String,
    build_dir: PathBuf,
    download_timeout: Duration,
}

#[async_trait]
impl Step for CloudflaredStep {
    fn id(&self) -> &str {
        "cloudflared"
    }

    fn description(&self) -> &str {
        "Install cloudflared"
    }

    fn network_bound(&self) -> bool {
        true
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        Ok(match cloudflared::version(ctx.runner()).await? {
            Some(version) => Detection::Satisfied(format!("cloudflared {version} installed")),
            None => Detection::Missing,
        })
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let arch = apt::architecture(ctx.runner()).await?;
        let package = self.build_dir.join(format!("cloudflared-{arch}.deb"));
        Downloader::new(self.download_timeout)?
            .download(&cloudflared::deb_url(&self.release_url, &arch), &package)
            .await?;
        apt::install_deb(ctx.runner(), &package).await?;
        tokio::fs::remove_file(&package).await.ok();
        ctx.note(format!("installed cloudflared for {arch}"));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        Ok(match cloudflared::version(ctx.runner()).await? {
            Some(_) => Verification::Passed,
            None => Verification::Failed("cloudflared is not on PATH".to_string()),
        })
    }
}

fn api_for(factory: &ApiFactory, ctx: &StepContext<'_>) -> Result<Arc<dyn CloudflareApi>, StepError> {
    let token = ctx.require_config(API_TOKEN)?;
    Ok(factory(&token)?)
}

pub fn default_tunnel_name(domain: &str) -> String {
    format!("piprov-{}", domain.replace('.', "-"))
}

pub fn render_tunnel_config(tunnel_id: &str, domain: &str, service: &str) -> String {
    format!(
        "# Managed by piprov; local changes are overwritten.\n\
         tunnel: {tunnel_id}\n\
         credentials-file: {dir}/{tunnel_id}.json\n\
         \n\
         ingress:\n\
         \x20 - hostname: {domain}\n\
         \x20   service: {service}\n\
         \x20 - service: http_status:404\n",
        dir = cloudflared::CONFIG_DIR,
    )
}

/// Creates or reuses the named tunnel and writes its local configuration.
pub struct TunnelStep {
    api: ApiFactory,
    tunnel_name: Option<String>,
    local_service: String,
    config_dir: PathBuf,
}

impl TunnelStep {
    fn credentials_path(&self, tunnel_id: &str) -> PathBuf {
        self.config_dir.join(format!("{tunnel_id}.json"))
    }

    fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.yml")
    }

    fn expected(&self, ctx: &StepContext<'_>) -> Result<Option<(String, String)>, StepError> {
        let Some(tunnel_id) = ctx.config(TUNNEL_ID) else {
            return Ok(None);
        };
        let domain = ctx.require_config(DOMAIN)?;
        let rendered = render_tunnel_config(&tunnel_id, &domain, &self.local_service);
        Ok(Some((tunnel_id, rendered)))
    }
}

#[async_trait]
impl Step for TunnelStep {
    fn id(&self) -> &str {
        "cloudflare-tunnel"
    }

    fn description(&self) -> &str {
        "Create the Cloudflare Tunnel and its credentials"
    }

    fn network_bound(&self) -> bool {
        true
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let Some((tunnel_id, rendered)) = self.expected(ctx)? else {
            return Ok(Detection::Missing);
        };
        if !self.credentials_path(&tunnel_id).exists() {
            return Ok(Detection::Missing);
        }
        Ok(match file_detection(&self.config_path(), &rendered) {
            Detection::Satisfied(_) => Detection::Satisfied(format!("tunnel {tunnel_id} configured")),
            other => other,
        })
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let domain = ctx.require_config(DOMAIN)?;
        let api = api_for(&self.api, ctx)?;

        let zone = api.find_zone(&domain).await?;
        let account = zone.account.id.clone();
        ctx.remember(ZONE_ID, &zone.id, false)?;
        ctx.remember(ACCOUNT_ID, &account, false)?;

        let name = self
            .tunnel_name
            .clone()
            .unwrap_or_else(|| default_tunnel_name(&domain));
        let existing = api
            .list_tunnels(&account, &name)
            .await?
            .into_iter()
            .find(|t| t.deleted_at.is_none());

        let (tunnel, created) = match existing {
            Some(tunnel) => (tunnel, false),
            None => {
                let secret = generate_tunnel_secret();
                let tunnel = api.create_tunnel(&account, &name, &secret).await?;
                // Persist at once: the secret cannot be read back for a
                // tunnel created with a local secret if this run dies now.
                ctx.remember(TUNNEL_ID, &tunnel.id, false)?;
                ctx.remember(TUNNEL_SECRET, &secret, true)?;
                (tunnel, true)
            }
        };

        let secret = match (ctx.config(TUNNEL_ID), ctx.config(TUNNEL_SECRET)) {
            (Some(id), Some(secret)) if id == tunnel.id => secret,
            _ => api.tunnel_token(&account, &tunnel.id).await?.tunnel_secret,
        };
        ctx.remember(TUNNEL_ID, &tunnel.id, false)?;
        ctx.remember(TUNNEL_SECRET, &secret, true)?;

        let credentials = TunnelCredentials {
            account_tag: account,
            tunnel_secret: secret,
            tunnel_id: tunnel.id.clone(),
        };
        install_file(ctx, &self.credentials_path(&tunnel.id), &credentials.to_json()?, 0o600)?;

        let rendered = render_tunnel_config(&tunnel.id, &domain, &self.local_service);
        if install_file(ctx, &self.config_path(), &rendered, 0o644)? {
            restart_if_active(ctx, cloudflared::SERVICE).await?;
        }

        let verb = if created { "created" } else { "reused" };
        ctx.note(format!("{verb} tunnel {name} ({})", tunnel.id));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        let Some((tunnel_id, rendered)) = self.expected(ctx)? else {
            return Ok(Verification::Failed("no tunnel id recorded".to_string()));
        };
        if !self.credentials_path(&tunnel_id).exists() {
            return Ok(Verification::Failed(format!(
                "{} is missing",
                self.credentials_path(&tunnel_id).display()
            )));
        }
        Ok(file_verification(&self.config_path(), &rendered))
    }
}

/// Routes the domain to the tunnel with a proxied CNAME.
pub struct DnsRouteStep {
    api: ApiFactory,
}

struct Route {
    api: Arc<dyn CloudflareApi>,
    zone_id: String,
    domain: String,
    target: String,
}

impl DnsRouteStep {
    fn route(&self, ctx: &StepContext<'_>) -> Result<Route, StepError> {
        let tunnel_id = ctx.require_config(TUNNEL_ID)?;
        Ok(Route {
            api: api_for(&self.api, ctx)?,
            zone_id: ctx.require_config(ZONE_ID)?,
            domain: ctx.require_config(DOMAIN)?,
            target: format!("{tunnel_id}.cfargotunnel.com"),
        })
    }

    async fn change(route: &Route) -> Result<RecordChange, StepError> {
        let records = route.api.dns_records(&route.zone_id, &route.domain).await?;
        Ok(plan_record_change(&records, &route.domain, &route.target))
    }
}

#[async_trait]
impl Step for DnsRouteStep {
    fn id(&self) -> &str {
        "dns-route"
    }

    fn description(&self) -> &str {
        "Point the domain at the tunnel"
    }

    fn network_bound(&self) -> bool {
        true
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let route = self.route(ctx)?;
        match Self::change(&route).await? {
            RecordChange::Unchanged => Ok(Detection::Satisfied(format!(
                "{} already routes to the tunnel",
                route.domain
            ))),
            RecordChange::Create => Ok(Detection::Missing),
            RecordChange::Update { .. } => Ok(Detection::Drifted(format!(
                "{} points elsewhere",
                route.domain
            ))),
            RecordChange::Conflict { kind } => Err(CloudflareError::RecordConflict {
                name: route.domain,
                kind,
            }
            .into()),
        }
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let route = self.route(ctx)?;
        let outcome = route
            .api
            .ensure_cname(&route.zone_id, &route.domain, &route.target)
            .await?;
        let verb = match outcome {
            RecordOutcome::Unchanged => "kept",
            RecordOutcome::Created => "created",
            RecordOutcome::Updated => "updated",
        };
        ctx.note(format!("{verb} CNAME {} -> {}", route.domain, route.target));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        let route = self.route(ctx)?;
        Ok(match Self::change(&route).await? {
            RecordChange::Unchanged => Verification::Passed,
            _ => Verification::Failed(format!("{} does not route to the tunnel", route.domain)),
        })
    }
}

/// Registers and starts the cloudflared systemd unit.
pub struct CloudflaredServiceStep {
    poll_delay: Duration,
}

#[async_trait]
impl Step for CloudflaredServiceStep {
    fn id(&self) -> &str {
        "cloudflared-service"
    }

    fn description(&self) -> &str {
        "Install and start the cloudflared service"
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let runner = ctx.runner();
        let running = systemd::is_enabled(runner, cloudflared::SERVICE).await?
            && systemd::is_active(runner, cloudflared::SERVICE).await?;
        Ok(if running {
            Detection::Satisfied("cloudflared is enabled and running".to_string())
        } else {
            Detection::Missing
        })
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        cloudflared::service_install(ctx.runner()).await?;
        start_service(ctx, cloudflared::SERVICE).await
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        verify_active(ctx, cloudflared::SERVICE, self.poll_delay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_installed_version() {
        let dir = TempDir::new().unwrap();
        assert_eq!(installed_version(dir.path()), None);

        std::fs::create_dir_all(dir.path().join("wp-includes")).unwrap();
        std::fs::write(
            dir.path().join("wp-includes/version.php"),
            "<?php\n/**\n * The WordPress version string.\n */\n$wp_version = '6.5.2';\n",
        )
        .unwrap();
        assert_eq!(installed_version(dir.path()), Some("6.5.2".to_string()));
    }

    #[test]
    fn test_merge_into_keeps_existing_entries() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("src");
        let to = dir.path().join("www");
        std::fs::create_dir_all(from.join("wp-content")).unwrap();
        std::fs::write(from.join("index.php"), "new").unwrap();
        std::fs::create_dir_all(to.join("wp-content")).unwrap();
        std::fs::write(to.join("wp-content/uploaded.jpg"), "keep").unwrap();

        assert_eq!(merge_into(&from, &to).unwrap(), 1);
        assert!(to.join("index.php").exists());
        assert!(to.join("wp-content/uploaded.jpg").exists());
    }

    #[test]
    fn test_render_wp_config() {
        let salts: Vec<String> = (0..8).map(|i| format!("salt{i}")).collect();
        let php = render_wp_config(&WpConfig {
            db_name: "wordpress",
            db_user: "wp",
            db_password: "it's-secret",
            domain: "blog.example.com",
            salts: &salts,
        });

        assert!(php.starts_with("<?php\n"));
        assert!(php.contains("define( 'DB_PASSWORD', 'it\\'s-secret' );"));
        assert!(php.contains("define( 'NONCE_SALT', 'salt7' );"));
        assert!(php.contains("define( 'WP_HOME', 'https://blog.example.com' );"));
        assert!(php.contains("$_SERVER['HTTPS'] = 'on';"));
        assert!(php.trim_end().ends_with("require_once ABSPATH . 'wp-settings.php';"));
    }

    #[test]
    fn test_render_vhost() {
        let conf = render_vhost("blog.example.com", Path::new("/var/www/wordpress"));
        assert!(conf.contains("    ServerName blog.example.com\n"));
        assert!(conf.contains("    <Directory /var/www/wordpress>\n"));
        assert!(conf.contains("${APACHE_LOG_DIR}/wordpress-error.log"));
    }

    #[test]
    fn test_render_tunnel_config() {
        let yml = render_tunnel_config("abc-123", "blog.example.com", "http://localhost:80");
        assert!(yml.contains("tunnel: abc-123\n"));
        assert!(yml.contains("credentials-file: /etc/cloudflared/abc-123.json\n"));
        assert!(yml.contains("  - hostname: blog.example.com\n    service: http://localhost:80\n"));
        assert!(yml.ends_with("  - service: http_status:404\n"));
    }

    #[test]
    fn test_default_tunnel_name() {
        assert_eq!(default_tunnel_name("blog.example.com"), "piprov-blog-example-com");
    }
}
