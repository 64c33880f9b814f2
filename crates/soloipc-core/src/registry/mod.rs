//! Global service registry for cross-process instance arbitration.
//!
//! A SQLite-backed table mapping service names to the daemon currently
//! holding them (PID, IPC port). A row is written in two situations:
//! - **Claim**: atomically at startup, so only one racing launch proceeds
//! - **Register**: after a retained unbind, marking the daemon discoverable
//!   for direct lookup without a new announcement
//!
//! # Location
//!
//! - **Linux**: `~/.config/soloipc/registry.db`
//! - **macOS**: `~/Library/Application Support/soloipc/registry.db`
//! - Anywhere: `$SOLOIPC_HOME/registry.db`

pub mod service_registry;

pub use service_registry::{Claim, ServiceEntry, ServiceRegistry};
