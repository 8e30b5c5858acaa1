//! Typed wrappers around the system tools a recipe drives.
//!
//! Every adapter goes through a [`CommandRunner`](piprov_command_runner::CommandRunner)
//! so that timeouts, retries and the run log apply uniformly, and so that
//! tests can script the tools with `MockRunner`.

use thiserror::Error;

use piprov_command_runner::RunnerError;
use piprov_step_engine::StepError;

pub mod alsa;
pub mod apt;
pub mod cloudflared;
pub mod download;
pub mod files;
pub mod mysql;
pub mod systemd;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Command(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download of {url} failed with HTTP {status}")]
    Download { url: String, status: u16 },

    #[error("unexpected output from {tool}: {message}")]
    Parse { tool: &'static str, message: String },

    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),

    #[error("no usable audio output found")]
    NoAudioOutput,
}

impl From<AdapterError> for StepError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Command(e) => StepError::Command(e),
            AdapterError::Io(e) => StepError::Io(e),
            e @ (AdapterError::Http(_) | AdapterError::Download { .. }) => {
                StepError::external("download", e.to_string())
            }
            e => StepError::failed(e.to_string()),
        }
    }
}
