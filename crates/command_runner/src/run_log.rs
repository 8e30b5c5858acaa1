use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::command::REDACTED;

/// Append-only, timestamped log of everything a run did.
///
/// Cloning shares the underlying file handle and the set of registered
/// secrets, so the runner, the reporter and the collector all write into the
/// same file in call order and mask the same values.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    secrets: Arc<Mutex<Vec<String>>>,
}

impl RunLog {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
            secrets: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Masks `secret` in every line written from now on.
    ///
    /// Multi-line values register each line on its own.
    pub fn redact(&self, secret: &str) {
        let Ok(mut secrets) = self.secrets.lock() else {
            return;
        };
        for part in secret.lines().map(str::trim).filter(|p| !p.is_empty()) {
            if !secrets.iter().any(|s| s == part) {
                secrets.push(part.to_string());
            }
        }
        // Longest first, so a secret containing another is masked whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    /// `text` with every registered secret replaced by `********`.
    pub fn redacted(&self, text: &str) -> String {
        match self.secrets.lock() {
            Ok(secrets) => secrets
                .iter()
                .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED)),
            Err(_) => text.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped line per line of `message`.
    pub fn append(&self, category: &str, message: &str) -> io::Result<()> {
        let message = self.redacted(message);
        let ts = timestamp();
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "run log lock poisoned"))?;

        if message.is_empty() {
            writeln!(file, "{ts} [{category}]")?;
        }
        for line in message.lines() {
            writeln!(file, "{ts} [{category}] {line}")?;
        }
        file.flush()
    }

    /// Like [`RunLog::append`], but a failing write only reaches tracing.
    pub fn record(&self, category: &str, message: &str) {
        if let Err(e) = self.append(category, message) {
            tracing::warn!(path = %self.path.display(), "failed to write run log: {e}");
        }
    }
}

/// Current UTC time in RFC 3339.
pub fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown-time".to_string())
}
