//! Process identity and liveness.
//!
//! Liveness checks for registry cleanup, the effective uid stamped on
//! announcements, process renaming and tracer detection for debug attach.

use crate::cancel::CancellationToken;
use crate::error::{Result, SoloError};
use std::time::Duration;
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Effective uid of the current process.
pub fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().as_raw()
    }

    #[cfg(not(unix))]
    {
        0
    }
}

/// Whether the current process runs with elevated privileges.
pub fn is_privileged() -> bool {
    current_uid() == 0
}

/// Rename the current process as shown by `ps`/`top`.
///
/// Linux truncates the name to 15 bytes.
pub fn set_process_name(name: &str) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let c_name = std::ffi::CString::new(name).map_err(|_| SoloError::Validation {
            field: "process_name".to_string(),
            message: "Process name contains a NUL byte".to_string(),
        })?;
        nix::sys::prctl::set_name(&c_name)
            .map_err(|e| SoloError::Other(format!("prctl(PR_SET_NAME) failed: {}", e)))?;
        debug!("Process renamed to {}", name);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        warn!("Process rename not supported on this platform ({})", name);
        Ok(())
    }
}

/// Whether a debugger (any tracer) is attached to the current process.
///
/// # Platform Behavior
/// - **Linux**: non-zero `TracerPid` in `/proc/self/status`
/// - **Other**: always `false`
pub fn is_debugger_attached() -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => tracer_pid(&status).is_some_and(|pid| pid != 0),
            Err(e) => {
                warn!("Failed to read /proc/self/status: {}", e);
                false
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}

/// Block until `attached()` reports true, polling every `interval`.
///
/// There is no event to wait on, so this polls. No timeout: only the
/// cancellation token ends the wait early.
pub fn wait_for_debugger_with(
    interval: Duration,
    token: &CancellationToken,
    attached: impl Fn() -> bool,
) -> Result<()> {
    while !attached() {
        token.sleep(interval)?;
    }
    Ok(())
}

/// Block until a debugger attaches to this process.
pub fn wait_for_debugger(interval: Duration, token: &CancellationToken) -> Result<()> {
    wait_for_debugger_with(interval, token, is_debugger_attached)
}
