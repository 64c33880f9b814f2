//! Platform abstraction layer.
//!
//! This module centralizes all platform-specific code. All `#[cfg]` blocks
//! for OS-specific behavior should live here rather than scattered
//! throughout the codebase.
//!
//! # Architecture
//!
//! - `paths` - Config directory, registry and announcement locations
//! - `process` - Liveness, identity, renaming and debugger detection
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Everything except process rename and tracer detection

pub mod paths;
pub mod process;

pub use paths::{announce_dir, current_code_path, registry_db_path, shared_bin_dirs};
pub use process::{
    current_uid, is_debugger_attached, is_privileged, is_process_alive, set_process_name,
    wait_for_debugger, wait_for_debugger_with,
};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform() {
        let platform = current_platform();
        assert!(["linux", "macos", "unknown"].contains(&platform));
    }
}
