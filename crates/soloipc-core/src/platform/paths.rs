//! Platform-specific path utilities.
//!
//! This module provides functions to get platform-specific paths for:
//! - The soloipc configuration directory
//! - The service registry database
//! - The announcement directory
//! - Shared binary directories used by the self-watch

use crate::config::{AppConfig, PathsConfig, RegistryConfig};
use crate::error::{Result, SoloError};
use std::path::{Path, PathBuf};

/// Get the soloipc configuration directory.
///
/// `SOLOIPC_HOME` overrides the platform default.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/soloipc` (XDG_CONFIG_HOME)
/// - **macOS**: `~/Library/Application Support/soloipc`
pub fn soloipc_config_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(AppConfig::HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let config_dir = dirs::config_dir().ok_or_else(|| SoloError::Config {
        message: "Could not determine platform config directory".to_string(),
    })?;
    Ok(config_dir.join(PathsConfig::CONFIG_DIR_NAME))
}

/// Get the path to the service registry database.
///
/// Returns `{soloipc_config_dir}/registry.db`.
pub fn registry_db_path() -> Result<PathBuf> {
    Ok(soloipc_config_dir()?.join(RegistryConfig::DB_FILENAME))
}

/// Get the directory announcements are written to.
///
/// Returns `{soloipc_config_dir}/announce`.
pub fn announce_dir() -> Result<PathBuf> {
    Ok(soloipc_config_dir()?.join(PathsConfig::ANNOUNCE_DIR_NAME))
}

/// Directories whose entries belong to unrelated programs.
///
/// The system binary directories plus `~/.cargo/bin` and `~/.local/bin`
/// when a home directory is known.
pub fn shared_bin_dirs() -> Vec<PathBuf> {
    let mut shared: Vec<PathBuf> = PathsConfig::SHARED_BIN_DIRS
        .iter()
        .map(PathBuf::from)
        .collect();
    if let Some(home) = dirs::home_dir() {
        shared.push(home.join(".cargo").join("bin"));
        shared.push(home.join(".local").join("bin"));
    }
    shared
}

/// Resolve the binary the current process was loaded from.
pub fn current_code_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.canonicalize().unwrap_or(exe))
}

/// Whether `dir` is one of `shared`, comparing canonical forms when possible.
pub fn is_shared_dir(dir: &Path, shared: &[PathBuf]) -> bool {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    shared.iter().any(|candidate| {
        let candidate = candidate
            .canonicalize()
            .unwrap_or_else(|_| candidate.clone());
        candidate == canonical
    })
}
