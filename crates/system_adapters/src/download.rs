use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use piprov_command_runner::{CommandRunner, CommandSpec};

use crate::AdapterError;

const BUILD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for release downloads.
///
/// Every request, body included, is bounded by the timeout so a stalled
/// mirror fails the attempt instead of hanging the step.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(CONNECT_TIMEOUT))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Streams `url` into `dest`. The file only appears once it is complete.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, AdapterError> {
        tracing::info!(url, dest = %dest.display(), "downloading");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::Download {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    tokio::fs::remove_file(&partial).await.ok();
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }

    /// Downloads and unpacks a source tarball into a fresh
    /// `<work_dir>/<name>` and returns the source root.
    pub async fn fetch_source(&self, url: &str, work_dir: &Path, name: &str) -> Result<PathBuf, AdapterError> {
        let archive = work_dir.join(format!("{name}.tar.gz"));
        let unpack_dir = work_dir.join(name);

        self.download(url, &archive).await?;
        if unpack_dir.exists() {
            tokio::fs::remove_dir_all(&unpack_dir).await?;
        }

        let (archive_path, target) = (archive.clone(), unpack_dir.clone());
        tokio::task::spawn_blocking(move || extract_tar_gz(&archive_path, &target))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        tokio::fs::remove_file(&archive).await.ok();

        single_root(&unpack_dir)
    }
}

/// Unpacks a `.tar.gz` into `dest`.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<(), AdapterError> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    std::fs::create_dir_all(dest)?;
    archive.unpack(dest)?;
    Ok(())
}

/// The only top-level directory of an unpacked archive.
pub fn single_root(dir: &Path) -> Result<PathBuf, AdapterError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        n => Err(AdapterError::Parse {
            tool: "tar",
            message: format!("expected one top-level directory in {}, found {n}", dir.display()),
        }),
    }
}

/// `autoreconf -fi && ./configure <args> && make -j<jobs> && make install`.
pub async fn build_autotools(
    runner: &dyn CommandRunner,
    source: &Path,
    configure_args: &[&str],
    jobs: usize,
) -> Result<(), AdapterError> {
    let steps = [
        CommandSpec::new("autoreconf").arg("-fi"),
        CommandSpec::new("./configure").args(configure_args.iter().copied()),
        CommandSpec::new("make").arg(format!("-j{}", jobs.max(1))),
        CommandSpec::new("make").arg("install"),
    ];
    for spec in steps {
        let spec = spec.current_dir(source).timeout(BUILD_TIMEOUT);
        runner.run(&spec).await?;
    }
    Ok(())
}

/// Parallel make jobs for this machine.
pub fn build_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
