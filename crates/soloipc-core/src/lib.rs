//! soloipc core - single-instance service daemons.
//!
//! A daemon exposes one named service endpoint on a local TCP port,
//! arbitrates against other processes racing to start the same service,
//! tracks a single bound client and exits cleanly when its client leaves or
//! its binary changes on disk.
//!
//! # Example
//!
//! ```rust,ignore
//! use soloipc_core::{DaemonBuilder, Launch, ServiceFactories};
//!
//! fn main() -> anyhow::Result<()> {
//!     let runtime = tokio::runtime::Runtime::new()?;
//!     let mut factories = ServiceFactories::new();
//!     factories.register("com.example.Root", MyService::default);
//!
//!     let launch = runtime.block_on(
//!         DaemonBuilder::new("com.example/.Root".parse()?)
//!             .factories(factories)
//!             .build(),
//!     )?;
//!     let status = match launch {
//!         Launch::Started(daemon) => daemon.run(),
//!         Launch::Ceded => 0,
//!     };
//!     std::process::exit(status);
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod ipc;
pub mod platform;
pub mod registry;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use daemon::{
    Announcement, AnnouncementDir, Announcer, Binding, ComponentName, DaemonBuilder,
    DaemonHandle, DaemonStatus, Intent, Launch, LocalAnnouncer, RootService, ServiceConfig,
    ServiceContext, ServiceDaemon, ServiceFactories, WatchTarget,
};
pub use error::{Result, SoloError};
pub use ipc::DaemonClient;
pub use registry::{Claim, ServiceEntry, ServiceRegistry};
