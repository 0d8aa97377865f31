use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static BASE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Default data directory, relative to the working directory
const DEFAULT_DATA_DIR: &str = "output";

/// Initialize the data directory from the `--data-dir` argument.
///
/// Must be called once before any other path is resolved. Later calls are
/// ignored so tests and the binary agree on a single location.
pub fn init_base_dir(dir: Option<&str>) {
    let resolved = match dir {
        Some(d) => PathBuf::from(shellexpand::tilde(d).as_ref()),
        None => PathBuf::from(DEFAULT_DATA_DIR),
    };
    let resolved = std::path::absolute(&resolved).unwrap_or(resolved);
    let _ = BASE_DIR.set(resolved);
}

/// Base directory for all qvm data (images, firmware vars, session records)
pub fn base_dir() -> PathBuf {
    BASE_DIR
        .get()
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Per-OS directory holding working images, identity keys and NVRAM files
pub fn os_dir(base: &Path, os: &str) -> PathBuf {
    base.join(os)
}

/// Directory of pristine base images used by snapshot sessions
pub fn cache_dir(base: &Path) -> PathBuf {
    base.join("cache")
}

/// Directory for session records
pub fn sessions_dir(base: &Path) -> PathBuf {
    base.join("sessions")
}

/// The invoking user's `~/.ssh` directory
pub fn ssh_dir() -> PathBuf {
    match directories::BaseDirs::new() {
        Some(dirs) => dirs.home_dir().join(".ssh"),
        None => PathBuf::from(shellexpand::tilde("~/.ssh").as_ref()),
    }
}
