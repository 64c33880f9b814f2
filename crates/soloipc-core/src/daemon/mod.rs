//! Single-instance service daemon.
//!
//! A daemon hosts exactly one [`RootService`] behind one IPC endpoint and
//! tracks at most one bound client.
//!
//! # Lifecycle
//!
//! 1. [`DaemonBuilder::build`] binds the endpoint and claims the registry
//!    slot for the component. If a live daemon already holds it, that daemon
//!    is asked to re-announce and the build returns [`Launch::Ceded`].
//! 2. [`ServiceDaemon::run`] creates the service on the calling thread, arms
//!    the [`SelfWatch`], announces the endpoint and serves calls.
//! 3. Unbind (without retain), client death (same), stop, `$terminate` or a
//!    change to the binary ends the loop; `run` returns the exit status.

mod builder;
pub mod announce;
pub mod intent;
pub mod looper;
pub mod service;
mod state;
pub mod watch;

pub use announce::{Announcement, AnnouncementDir, Announcer, LocalAnnouncer};
pub use builder::{DaemonBuilder, Launch};
pub use intent::{ComponentName, Intent, IntentExtras};
pub use looper::{LoopContext, LoopHandle, Looper};
pub use service::{
    Binding, RootService, ServiceConfig, ServiceContext, ServiceFactories, ServiceFactory,
};
pub use state::{DaemonHandle, DaemonStatus, DebuggerCheck, ServiceDaemon, VerbosityHook};
pub use watch::{EventMask, SelfWatch, WatchTarget};
