//! Centralized configuration for soloipc.
//!
//! Timing, limits and path names used across the daemon, the transport and
//! the registry.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "soloipc";
    /// Prefix of every registry service name.
    pub const SERVICE_NAME_PREFIX: &'static str = "soloipc";
    /// Environment variable overriding the config directory.
    pub const HOME_ENV: &'static str = "SOLOIPC_HOME";
}

/// Daemon state machine configuration.
pub struct DaemonConfig;

impl DaemonConfig {
    /// Interval between tracer checks while waiting for a debugger.
    pub const DEBUGGER_POLL_INTERVAL: Duration = Duration::from_millis(200);
    /// How many times arbitration retries a claim after clearing a stale slot.
    pub const CLAIM_ATTEMPTS: u32 = 3;
    /// Process suffix shown while waiting for a debugger.
    pub const DEBUG_PROCESS_SUFFIX: &'static str = ":root";
    /// Pause before a self-watch stop re-queues itself behind a held transition lock.
    pub const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(5);
    pub const EXIT_SUCCESS: i32 = 0;
    pub const EXIT_FAILURE: i32 = 1;
}

/// IPC transport configuration.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
    pub const MAX_CONNECTIONS: usize = 32;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// How long arbitration waits for a holder to answer a re-announce.
    pub const REANNOUNCE_TIMEOUT: Duration = Duration::from_secs(2);
    pub const BIND_ADDR: &'static str = "127.0.0.1:0";
}

/// Registry database configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DB_FILENAME: &'static str = "registry.db";
    pub const BUSY_TIMEOUT_MS: u32 = 5000;
}

/// Shared directory and path configurations.
pub struct PathsConfig;

impl PathsConfig {
    pub const CONFIG_DIR_NAME: &'static str = "soloipc";
    pub const ANNOUNCE_DIR_NAME: &'static str = "announce";
    /// Directories whose entries belong to unrelated programs. A binary
    /// installed directly in one of these is watched by file, not by directory.
    pub const SHARED_BIN_DIRS: &'static [&'static str] = &[
        "/bin",
        "/sbin",
        "/usr/bin",
        "/usr/sbin",
        "/usr/local/bin",
        "/usr/local/sbin",
    ];
}
