use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = "state.lock";

/// Version of the `state.json` layout.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("state in {path} is locked by running process {pid}")]
    Locked { path: PathBuf, pid: u32 },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ============================================================================
// Data model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    /// Completed and skipped steps are not run again unless forced.
    pub fn is_done(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in progress",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Number of times the step was started.
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEntry {
    pub id: String,
    #[serde(flatten)]
    pub result: StepResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: String,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationState {
    pub version: u32,
    pub profile: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
    #[serde(default)]
    pub config: BTreeMap<String, ConfigValue>,
}

impl InstallationState {
    pub fn new(profile: &str) -> Self {
        Self {
            version: FORMAT_VERSION,
            profile: profile.to_string(),
            created_at: OffsetDateTime::now_utc(),
            steps: Vec::new(),
            config: BTreeMap::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|e| e.id == id).map(|e| &e.result)
    }

    /// Last recorded status; steps never seen are pending.
    pub fn status(&self, id: &str) -> StepStatus {
        self.step(id).map(|r| r.status).unwrap_or(StepStatus::Pending)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(|v| v.value.as_str())
    }

    fn entry_mut(&mut self, id: &str) -> &mut StepResult {
        if let Some(pos) = self.steps.iter().position(|e| e.id == id) {
            return &mut self.steps[pos].result;
        }
        self.steps.push(StepEntry {
            id: id.to_string(),
            result: StepResult {
                status: StepStatus::Pending,
                timestamp: OffsetDateTime::now_utc(),
                detail: None,
                attempts: 0,
            },
        });
        let last = self.steps.len() - 1;
        &mut self.steps[last].result
    }
}

// ============================================================================
// Advisory lock
// ============================================================================

/// `state.lock` holding the owner's pid; removed on drop.
#[derive(Debug)]
struct StateLock {
    path: PathBuf,
}

impl StateLock {
    fn acquire(dir: &Path) -> Result<Self, StateError> {
        let path = dir.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match owner {
                        Some(pid) if process_alive(pid) => {
                            return Err(StateError::Locked {
                                path: dir.to_path_buf(),
                                pid,
                            });
                        }
                        _ => {
                            tracing::warn!(lock = %path.display(), ?owner, "removing stale state lock");
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StateError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("could not acquire {}", path.display()),
        )))
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), "failed to remove state lock: {e}");
        }
    }
}

/// Check if a PID is alive using `kill(pid, 0)`.
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

// ============================================================================
// StateStore
// ============================================================================

/// Durable, locked record of one profile's installation progress.
///
/// Every mutation is flushed to disk before it returns.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    path: PathBuf,
    state: InstallationState,
    _lock: StateLock,
}

impl StateStore {
    /// Locks `dir` and loads its state, creating it on first use.
    pub fn open(dir: &Path) -> Result<Self, StateError> {
        ensure_private_dir(dir)?;
        let lock = StateLock::acquire(dir)?;
        let path = dir.join(STATE_FILE);

        let (state, fresh) = match load(&path)? {
            Some(state) => (state, false),
            None => (InstallationState::new(&profile_name(dir)), true),
        };

        let store = Self {
            dir: dir.to_path_buf(),
            path,
            state,
            _lock: lock,
        };
        if fresh {
            store.persist()?;
        }
        Ok(store)
    }

    /// Moves a corrupt state file aside and starts over. Only call after
    /// the user confirmed.
    pub fn open_discarding_corrupt(dir: &Path) -> Result<Self, StateError> {
        ensure_private_dir(dir)?;
        let lock = StateLock::acquire(dir)?;
        let path = dir.join(STATE_FILE);

        if path.exists() {
            let stamp = OffsetDateTime::now_utc().unix_timestamp();
            let aside = dir.join(format!("{STATE_FILE}.corrupt-{stamp}"));
            fs::rename(&path, &aside)?;
            tracing::warn!(moved_to = %aside.display(), "discarded corrupt state");
        }

        let store = Self {
            dir: dir.to_path_buf(),
            path,
            state: InstallationState::new(&profile_name(dir)),
            _lock: lock,
        };
        store.persist()?;
        Ok(store)
    }

    /// Reads a snapshot without locking. `None` if no state exists.
    pub fn read(dir: &Path) -> Result<Option<InstallationState>, StateError> {
        load(&dir.join(STATE_FILE))
    }

    /// Deletes the recorded state of `dir`. Returns whether anything existed.
    pub fn reset(dir: &Path) -> Result<bool, StateError> {
        if !dir.exists() {
            return Ok(false);
        }
        let _lock = StateLock::acquire(dir)?;
        let path = dir.join(STATE_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn state(&self) -> &InstallationState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self, id: &str) -> StepStatus {
        self.state.status(id)
    }

    /// Marks `id` in progress before it runs, so a crash leaves a truthful record.
    pub fn record_step_start(&mut self, id: &str) -> Result<(), StateError> {
        let entry = self.state.entry_mut(id);
        entry.status = StepStatus::InProgress;
        entry.timestamp = OffsetDateTime::now_utc();
        entry.detail = None;
        entry.attempts += 1;
        self.persist()
    }

    pub fn record_step_result(
        &mut self,
        id: &str,
        status: StepStatus,
        detail: Option<String>,
    ) -> Result<(), StateError> {
        let entry = self.state.entry_mut(id);
        entry.status = status;
        entry.timestamp = OffsetDateTime::now_utc();
        entry.detail = detail;
        self.persist()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.state.get(key)
    }

    pub fn set(&mut self, key: &str, value: &str, sensitive: bool) -> Result<(), StateError> {
        self.state.config.insert(
            key.to_string(),
            ConfigValue {
                value: value.to_string(),
                sensitive,
            },
        );
        self.persist()
    }

    fn persist(&self) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(&self.state)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&data)?;
        temp.write_all(b"\n")?;
        temp.as_file().sync_all()?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
        temp.persist(&self.path).map_err(|e| e.error)?;

        // Make the rename itself durable.
        File::open(&self.dir)?.sync_all()?;

        tracing::trace!(path = %self.path.display(), "state persisted");
        Ok(())
    }
}

fn load(path: &Path) -> Result<Option<InstallationState>, StateError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state: InstallationState =
        serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if state.version > FORMAT_VERSION {
        return Err(StateError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported state version {}", state.version),
        });
    }
    Ok(Some(state))
}

fn ensure_private_dir(dir: &Path) -> Result<(), StateError> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

fn profile_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
