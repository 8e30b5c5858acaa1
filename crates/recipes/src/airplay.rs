//! AirPlay 2 receiver: NQPTP and shairport-sync built from source, playing
//! through an auto-detected ALSA output.

use std::path::PathBuf;

use async_trait::async_trait;

use piprov_collector::{ParameterSpec, Validator};
use piprov_step_engine::{Detection, Step, StepContext, StepError, Verification};
use piprov_system_adapters::alsa::{self, AlsaCard};
use piprov_system_adapters::AdapterError;

use crate::common::{
    file_detection, file_verification, install_file, preflight_checks, restart_if_active,
    AptPackagesStep, ServiceStep, SourceBuildStep,
};
use crate::{Profile, Recipe, RecipeContext};

pub const DEVICE_NAME: &str = "device_name";
pub const OUTPUT_DEVICE: &str = "output_device";

pub const NQPTP_SERVICE: &str = "nqptp";
pub const SHAIRPORT_SERVICE: &str = "shairport-sync";
pub const CONF_PATH: &str = "/etc/shairport-sync.conf";

const MIN_DISK_MIB: u64 = 1024;

pub const BUILD_PACKAGES: &[&str] = &[
    "build-essential",
    "git",
    "autoconf",
    "automake",
    "libtool",
    "pkg-config",
    "libpopt-dev",
    "libconfig-dev",
    "libasound2-dev",
    "alsa-utils",
    "avahi-daemon",
    "libavahi-client-dev",
    "libssl-dev",
    "libsoxr-dev",
    "libplist-dev",
    "libsodium-dev",
    "libgcrypt20-dev",
    "libavutil-dev",
    "libavcodec-dev",
    "libavformat-dev",
    "uuid-dev",
    "xxd",
];

const SHAIRPORT_CONFIGURE: &[&str] = &[
    "--sysconfdir=/etc",
    "--with-alsa",
    "--with-soxr",
    "--with-avahi",
    "--with-ssl=openssl",
    "--with-systemd",
    "--with-airplay-2",
];

fn github_tarball(project: &str, version: &str) -> String {
    format!("https://github.com/mikebrady/{project}/archive/refs/tags/{version}.tar.gz")
}

pub fn recipe(ctx: &RecipeContext) -> Recipe {
    let config = &ctx.config;
    let build_dir = config.paths.build_dir.clone();
    let conf_path = ctx.path(CONF_PATH);

    let steps: Vec<Box<dyn Step>> = vec![
        Box::new(AptPackagesStep::new(
            "build-dependencies",
            "Install build tools and audio libraries",
            BUILD_PACKAGES,
        )),
        Box::new(SourceBuildStep {
            id: "nqptp",
            description: "Build and install NQPTP",
            name: "nqptp",
            url: github_tarball("nqptp", &config.airplay.nqptp_version),
            configure_args: vec!["--with-systemd-startup"],
            binary: "nqptp",
            feature: None,
            build_dir: build_dir.clone(),
            download_timeout: config.runner.timeout(),
        }),
        Box::new(ServiceStep::new(
            "nqptp-service",
            "Enable and start the NQPTP service",
            NQPTP_SERVICE,
            ctx.poll_delay,
        )),
        Box::new(SourceBuildStep {
            id: "shairport-sync",
            description: "Build and install shairport-sync with AirPlay 2",
            name: "shairport-sync",
            url: github_tarball("shairport-sync", &config.airplay.shairport_sync_version),
            configure_args: SHAIRPORT_CONFIGURE.to_vec(),
            binary: "shairport-sync",
            feature: Some("AirPlay2"),
            build_dir,
            download_timeout: config.runner.timeout(),
        }),
        Box::new(AudioOutputStep {
            conf_path: conf_path.clone(),
            volume: config.airplay.volume_percent,
        }),
        Box::new(ServiceStep::new(
            "shairport-sync-service",
            "Enable and start shairport-sync",
            SHAIRPORT_SERVICE,
            ctx.poll_delay,
        )),
    ];

    Recipe {
        profile: Profile::Airplay,
        steps,
        parameters: parameters(ctx),
        checks: preflight_checks(config, MIN_DISK_MIB, &ctx.path("/")),
        services: vec![NQPTP_SERVICE, SHAIRPORT_SERVICE],
        files: vec![conf_path],
    }
}

pub fn parameters(ctx: &RecipeContext) -> Vec<ParameterSpec> {
    vec![
        ParameterSpec::new(DEVICE_NAME, "AirPlay device name")
            .default_value(ctx.hostname.clone())
            .validator(Validator::DeviceName),
        ParameterSpec::new(OUTPUT_DEVICE, "ALSA output card (blank to auto-detect)").optional(),
    ]
}

/// Renders `/etc/shairport-sync.conf`.
///
/// Without a hardware mixer shairport-sync falls back to software volume.
pub fn render_shairport_conf(name: &str, device: &str, mixer: Option<&str>) -> String {
    let mut alsa = format!("    output_device = \"{device}\";\n");
    if let Some(mixer) = mixer {
        alsa.push_str(&format!("    mixer_control_name = \"{mixer}\";\n"));
    }
    format!(
        "// Managed by piprov; local changes are overwritten.\n\
         general =\n\
         {{\n    name = \"{name}\";\n    output_backend = \"alsa\";\n}};\n\
         \n\
         alsa =\n\
         {{\n{alsa}}};\n"
    )
}

struct AudioPlan {
    card: AlsaCard,
    mixer: Option<String>,
    rendered: String,
}

/// Picks the ALSA output and mixer and writes the shairport-sync config.
pub struct AudioOutputStep {
    conf_path: PathBuf,
    volume: u8,
}

impl AudioOutputStep {
    async fn plan(&self, ctx: &StepContext<'_>) -> Result<AudioPlan, StepError> {
        let name = ctx.require_config(DEVICE_NAME)?;
        let preferred = ctx.config(OUTPUT_DEVICE);

        let cards = alsa::list_cards(ctx.runner()).await?;
        let card = alsa::choose_output(&cards, preferred.as_deref())
            .cloned()
            .ok_or(AdapterError::NoAudioOutput)?;
        let controls = alsa::mixer_controls(ctx.runner(), &card).await?;
        let mixer = alsa::choose_mixer(&controls).map(str::to_string);
        let rendered = render_shairport_conf(&name, &card.hw_device(), mixer.as_deref());

        Ok(AudioPlan {
            card,
            mixer,
            rendered,
        })
    }
}

#[async_trait]
impl Step for AudioOutputStep {
    fn id(&self) -> &str {
        "audio-output"
    }

    fn description(&self) -> &str {
        "Select the audio output and write shairport-sync.conf"
    }

    async fn detect(&self, ctx: &mut StepContext<'_>) -> Result<Detection, StepError> {
        let plan = self.plan(ctx).await?;
        Ok(file_detection(&self.conf_path, &plan.rendered))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let plan = self.plan(ctx).await?;
        if let Some(mixer) = &plan.mixer {
            alsa::set_volume(ctx.runner(), &plan.card, mixer, self.volume).await?;
        }
        if install_file(ctx, &self.conf_path, &plan.rendered, 0o644)? {
            restart_if_active(ctx, SHAIRPORT_SERVICE).await?;
        }
        ctx.note(format!(
            "output {} ({}), mixer {}",
            plan.card.hw_device(),
            plan.card.name,
            plan.mixer.as_deref().unwrap_or("software")
        ));
        Ok(())
    }

    async fn verify(&self, ctx: &mut StepContext<'_>) -> Result<Verification, StepError> {
        let plan = self.plan(ctx).await?;
        Ok(file_verification(&self.conf_path, &plan.rendered))
    }
}
