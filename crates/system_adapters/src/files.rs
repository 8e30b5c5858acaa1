use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use piprov_command_runner::{CommandRunner, CommandSpec};

use crate::AdapterError;

const BACKUP_SUFFIX: &str = "piprov-bak";

/// Where [`backup_file`] keeps the previous version of `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

/// Copies an existing file aside before it is rewritten.
///
/// Returns `None` when there is nothing to back up.
pub fn backup_file(path: &Path) -> io::Result<Option<PathBuf>> {
    if !path.is_file() {
        return Ok(None);
    }
    let backup = backup_path(path);
    fs::copy(path, &backup)?;
    Ok(Some(backup))
}

/// Whether `path` already holds exactly `content`.
pub fn file_matches(path: &Path, content: &str) -> bool {
    fs::read(path).map(|c| c == content.as_bytes()).unwrap_or(false)
}

/// Atomically replaces `path` with `content` and `mode`.
///
/// Returns `false` without touching the file when the content already
/// matches; only the mode is corrected then.
pub fn write_if_changed(path: &Path, content: &str, mode: u32) -> io::Result<bool> {
    if file_matches(path, content) {
        fs::set_permissions(path, Permissions::from_mode(mode))?;
        return Ok(false);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), Permissions::from_mode(mode))?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(true)
}

/// `chown [-R] owner path`.
pub async fn chown(
    runner: &dyn CommandRunner,
    path: &Path,
    owner: &str,
    recursive: bool,
) -> Result<(), AdapterError> {
    let mut spec = CommandSpec::new("chown");
    if recursive {
        spec = spec.arg("-R");
    }
    runner
        .run(&spec.arg(owner).arg(path.display().to_string()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_if_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/shairport-sync.conf");

        assert!(write_if_changed(&path, "general = {};\n", 0o644).unwrap());
        assert!(!write_if_changed(&path, "general = {};\n", 0o644).unwrap());
        assert!(write_if_changed(&path, "general = { name = \"x\"; };\n", 0o640).unwrap());

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_unchanged_write_fixes_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        assert!(!write_if_changed(&path, "{}", 0o600).unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_backup_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wp-config.php");

        assert_eq!(backup_file(&path).unwrap(), None);

        fs::write(&path, "old").unwrap();
        let backup = backup_file(&path).unwrap().unwrap();
        assert_eq!(backup, dir.path().join("wp-config.php.piprov-bak"));
        assert_eq!(fs::read_to_string(backup).unwrap(), "old");
    }
}
