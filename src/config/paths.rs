//! Filesystem locations for settings, the device directory and logs.

use directories::{BaseDirs, ProjectDirs};
use std::io;
use std::path::{Path, PathBuf};

/// Overrides the log directory. An empty value disables file logging.
pub const LOG_DIR_ENV: &str = "POE_RESET_LOG_DIR";

pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "poe-reset", "poe-reset").map(|dirs| dirs.config_dir().to_path_buf())
}

/// `<config dir>/config.toml`
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// `<config dir>/devices.toml`, used when no directory path is configured.
pub fn devices_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("devices.toml"))
}

/// Resolve a leading `~/` against the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/").zip(home_dir()) {
        Some((rest, home)) => home.join(rest),
        None => PathBuf::from(path),
    }
}

fn home_dir() -> Option<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
}

pub fn log_dir() -> Option<PathBuf> {
    match std::env::var(LOG_DIR_ENV) {
        Ok(raw) if raw.trim().is_empty() => None,
        Ok(raw) => Some(PathBuf::from(raw.trim())),
        Err(_) => config_dir().map(|dir| dir.join("logs")),
    }
}

/// Create the log directory if needed and return it.
pub fn ensure_log_dir() -> io::Result<PathBuf> {
    let dir = log_dir().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "Could not determine log directory")
    })?;
    ensure_private_dir(&dir)?;
    Ok(dir)
}

/// Create `dir` and its parents, owner-only on unix. Logs may name
/// switch addresses and the config dir may hold credentials.
fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
