//! Daemon construction and singleton arbitration.

use super::announce::{AnnouncementDir, Announcer};
use super::intent::ComponentName;
use super::looper::Looper;
use super::service::{ServiceContext, ServiceFactories};
use super::state::{DaemonCore, DaemonEndpoint, DebuggerCheck, ServiceDaemon, VerbosityHook};
use super::watch::WatchTarget;
use crate::config::{DaemonConfig, IpcConfig};
use crate::error::{Result, SoloError};
use crate::ipc::{DaemonClient, IpcServer};
use crate::platform::{current_code_path, shared_bin_dirs};
use crate::registry::{Claim, ServiceRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Outcome of [`DaemonBuilder::build`].
pub enum Launch {
    /// This process owns the service slot.
    Started(ServiceDaemon),
    /// A live instance already serves the component and was asked to
    /// re-announce. This process should exit with success.
    Ceded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arbitration {
    Claimed,
    Ceded,
}

/// Builder for a [`ServiceDaemon`].
///
/// # Example
///
/// ```rust,ignore
/// let mut factories = ServiceFactories::new();
/// factories.register("com.example.Root", || MyService::default());
///
/// match DaemonBuilder::new("com.example/.Root".parse()?)
///     .factories(factories)
///     .build()
///     .await?
/// {
///     Launch::Started(daemon) => std::process::exit(daemon.run()),
///     Launch::Ceded => std::process::exit(0),
/// }
/// ```
pub struct DaemonBuilder {
    component: ComponentName,
    factories: ServiceFactories,
    registry: Option<ServiceRegistry>,
    registry_path: Option<PathBuf>,
    announcer: Option<Arc<dyn Announcer>>,
    code_path: Option<PathBuf>,
    shared_dirs: Option<Vec<PathBuf>>,
    verbosity_hook: Option<VerbosityHook>,
    debugger_check: Option<DebuggerCheck>,
    pid: Option<u32>,
}

impl DaemonBuilder {
    pub fn new(component: ComponentName) -> Self {
        Self {
            component,
            factories: ServiceFactories::new(),
            registry: None,
            registry_path: None,
            announcer: None,
            code_path: None,
            shared_dirs: None,
            verbosity_hook: None,
            debugger_check: None,
            pid: None,
        }
    }

    /// Service implementations to choose from by class name.
    pub fn factories(mut self, factories: ServiceFactories) -> Self {
        self.factories = factories;
        self
    }

    /// Use an already-open registry.
    pub fn registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Open the registry database at `path`.
    ///
    /// Default: `registry.db` in the soloipc config directory.
    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    /// Default: an [`AnnouncementDir`] in the soloipc config directory.
    pub fn announcer(mut self, announcer: impl Announcer + 'static) -> Self {
        self.announcer = Some(Arc::new(announcer));
        self
    }

    /// Binary to self-watch. Default: the running executable.
    pub fn code_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_path = Some(path.into());
        self
    }

    /// Directories whose binaries are watched by file rather than by directory.
    pub fn shared_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.shared_dirs = Some(dirs);
        self
    }

    /// Called with the requested verbosity on every bind.
    pub fn on_verbosity_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.verbosity_hook = Some(Arc::new(hook));
        self
    }

    /// Replace tracer detection for debug-attach binds.
    pub fn debugger_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.debugger_check = Some(Arc::new(check));
        self
    }

    /// Instance id recorded in the registry. Default: the process id.
    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Bind the endpoint, arbitrate for the service slot and assemble the daemon.
    ///
    /// Must be called inside a tokio runtime, which keeps serving the
    /// endpoint while [`ServiceDaemon::run`] blocks.
    pub async fn build(self) -> Result<Launch> {
        let factory = self.factories.resolve(&self.component.class)?;

        let registry = match (self.registry, self.registry_path) {
            (Some(registry), _) => registry,
            (None, Some(path)) => ServiceRegistry::open_at(&path)?,
            (None, None) => ServiceRegistry::open()?,
        };
        let announcer: Arc<dyn Announcer> = match self.announcer {
            Some(announcer) => announcer,
            None => Arc::new(AnnouncementDir::open_default()?),
        };
        let code_path = match self.code_path {
            Some(path) => path,
            None => current_code_path()?,
        };
        let shared_dirs = self.shared_dirs.unwrap_or_else(shared_bin_dirs);
        let pid = self.pid.unwrap_or_else(std::process::id);

        let listener = TcpListener::bind(IpcConfig::BIND_ADDR).await?;
        let port = listener.local_addr()?.port();
        let service_name = self.component.service_name();

        if arbitrate(&registry, &service_name, pid, port).await? == Arbitration::Ceded {
            info!("{} is already running, ceding", self.component);
            return Ok(Launch::Ceded);
        }

        let looper = Looper::new();
        let core = Arc::new(
            DaemonCore::new(
                self.component.clone(),
                pid,
                port,
                looper.handle(),
                registry.clone(),
                announcer,
            )
            .with_verbosity_hook(self.verbosity_hook)
            .with_debugger_check(self.debugger_check),
        );

        let server = match IpcServer::start_with_listener(
            listener,
            Arc::new(DaemonEndpoint::new(core.clone())),
        ) {
            Ok(server) => server,
            Err(e) => {
                let _ = registry.unregister(&service_name, pid);
                return Err(e);
            }
        };

        let watch_target = WatchTarget::for_binary(&code_path, &shared_dirs);
        let context = ServiceContext::new(self.component, code_path);

        Ok(Launch::Started(ServiceDaemon::new(
            core,
            looper,
            factory,
            context,
            watch_target,
            server,
        )))
    }
}

/// Take the service slot, or defer to a live holder.
///
/// A holder that cannot be reached, does not answer in time, or turns out to
/// be a different daemon on a reused port is stale: its exact row is
/// released and the claim retried, a bounded number of times.
async fn arbitrate(
    registry: &ServiceRegistry,
    service: &str,
    pid: u32,
    port: u16,
) -> Result<Arbitration> {
    for attempt in 1..=DaemonConfig::CLAIM_ATTEMPTS {
        let holder = match registry.claim(service, pid, port)? {
            Claim::Claimed => {
                info!("Claimed {} (PID {}, port {})", service, pid, port);
                return Ok(Arbitration::Claimed);
            }
            Claim::Held(entry) => entry,
        };

        info!(
            "{} held by PID {} on port {}, asking it to re-announce",
            service, holder.pid, holder.port
        );
        let reannounced = match DaemonClient::connect_local(holder.port, holder.pid).await {
            Ok(client) => client.reannounce(service).await,
            Err(e) => Err(e),
        };

        match reannounced {
            Ok(()) => return Ok(Arbitration::Ceded),
            Err(e) if e.is_instance_lost() => {
                warn!(
                    "Holder of {} (PID {}) is gone, releasing its slot (attempt {}/{})",
                    service,
                    holder.pid,
                    attempt,
                    DaemonConfig::CLAIM_ATTEMPTS
                );
                registry.release_stale(&holder)?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(SoloError::ClaimFailed {
        service: service.to_string(),
        message: format!(
            "slot still held after {} attempts",
            DaemonConfig::CLAIM_ATTEMPTS
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::announce::LocalAnnouncer;
    use crate::daemon::intent::Intent;
    use crate::daemon::service::{Binding, RootService};
    use crate::ipc::{methods, ClientHandle, IpcDispatch};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Stands in for a live holder: counts re-announce requests.
    #[derive(Default)]
    struct Holder {
        broadcasts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl IpcDispatch for Holder {
        async fn dispatch(
            &self,
            _client: &ClientHandle,
            method: &str,
            _params: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, SoloError> {
            if method == methods::BROADCAST {
                self.broadcasts.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Bool(true))
            } else {
                Err(SoloError::MethodNotFound {
                    method: method.to_string(),
                })
            }
        }

        async fn terminate(&self) {}
    }

    struct Noop;

    impl RootService for Noop {
        fn on_bind(&mut self, _intent: &Intent) -> anyhow::Result<Option<Binding>> {
            Ok(None)
        }
    }

    fn component() -> ComponentName {
        ComponentName::new("app", "app.Noop")
    }

    fn builder(temp: &TempDir) -> DaemonBuilder {
        let mut factories = ServiceFactories::new();
        factories.register("app.Noop", || Noop);
        DaemonBuilder::new(component())
            .factories(factories)
            .registry_path(temp.path().join("registry.db"))
            .announcer(LocalAnnouncer::default())
            .code_path(temp.path().join("bin").join("app"))
    }

    fn registry(temp: &TempDir) -> ServiceRegistry {
        ServiceRegistry::open_at(&temp.path().join("registry.db")).unwrap()
    }

    /// A port nothing listens on.
    async fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_arbitrate_claims_empty_slot() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);

        let outcome = arbitrate(&registry, "soloipc:app/app.Noop", 10, 5000)
            .await
            .unwrap();

        assert_eq!(outcome, Arbitration::Claimed);
        assert_eq!(
            registry.lookup("soloipc:app/app.Noop").unwrap().unwrap().pid,
            10
        );
    }

    #[tokio::test]
    async fn test_arbitrate_cedes_to_live_holder_with_one_broadcast() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        let holder = Arc::new(Holder::default());
        let mut server = IpcServer::start(holder.clone()).await.unwrap();
        registry
            .claim("soloipc:app/app.Noop", 10, server.port)
            .unwrap();

        let outcome = arbitrate(&registry, "soloipc:app/app.Noop", 11, 5001)
            .await
            .unwrap();

        assert_eq!(outcome, Arbitration::Ceded);
        assert_eq!(holder.broadcasts.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.lookup("soloipc:app/app.Noop").unwrap().unwrap().pid,
            10
        );

        server.shutdown();
    }

    #[tokio::test]
    async fn test_arbitrate_replaces_stale_holder() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        let port = dead_port().await;
        registry.claim("soloipc:app/app.Noop", 10, port).unwrap();

        let outcome = arbitrate(&registry, "soloipc:app/app.Noop", 11, 5001)
            .await
            .unwrap();

        assert_eq!(outcome, Arbitration::Claimed);
        let entry = registry.lookup("soloipc:app/app.Noop").unwrap().unwrap();
        assert_eq!((entry.pid, entry.port), (11, 5001));
    }

    /// Start a real daemon endpoint for `class` in its own registry.
    async fn start_other(class: &str, pid: u32) -> (ServiceDaemon, LocalAnnouncer, TempDir) {
        let temp = TempDir::new().unwrap();
        let announcer = LocalAnnouncer::default();
        let mut factories = ServiceFactories::new();
        factories.register(class, || Noop);
        let launch = DaemonBuilder::new(ComponentName::new("app", class))
            .factories(factories)
            .registry_path(temp.path().join("registry.db"))
            .announcer(announcer.clone())
            .code_path(temp.path().join("bin").join("app"))
            .pid(pid)
            .build()
            .await
            .unwrap();
        match launch {
            Launch::Started(daemon) => (daemon, announcer, temp),
            Launch::Ceded => panic!("fresh registry should not cede"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_arbitrate_ignores_other_service_on_reused_port() {
        let (other, other_announcer, _other_temp) = start_other("app.Other", 40).await;
        let mut announcements = other_announcer.subscribe();

        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry
            .claim("soloipc:app/app.Noop", 999_999_999, other.port())
            .unwrap();

        let outcome = arbitrate(&registry, "soloipc:app/app.Noop", 11, 5001)
            .await
            .unwrap();

        assert_eq!(outcome, Arbitration::Claimed);
        let entry = registry.lookup("soloipc:app/app.Noop").unwrap().unwrap();
        assert_eq!((entry.pid, entry.port), (11, 5001));
        assert!(announcements.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_arbitrate_ignores_same_service_under_other_pid() {
        let (other, other_announcer, _other_temp) = start_other("app.Noop", 30).await;
        let mut announcements = other_announcer.subscribe();

        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry
            .claim("soloipc:app/app.Noop", 31, other.port())
            .unwrap();

        let outcome = arbitrate(&registry, "soloipc:app/app.Noop", 32, 5002)
            .await
            .unwrap();

        assert_eq!(outcome, Arbitration::Claimed);
        assert_eq!(
            registry.lookup("soloipc:app/app.Noop").unwrap().unwrap().pid,
            32
        );
        assert!(announcements.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_arbitrate_replaces_silent_holder() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry.claim("soloipc:app/app.Noop", 10, port).unwrap();

        let outcome = tokio::time::timeout(
            IpcConfig::REANNOUNCE_TIMEOUT * 3,
            arbitrate(&registry, "soloipc:app/app.Noop", 11, 5001),
        )
        .await
        .expect("arbitration must not wait on a silent holder")
        .unwrap();

        assert_eq!(outcome, Arbitration::Claimed);
        assert_eq!(
            registry.lookup("soloipc:app/app.Noop").unwrap().unwrap().pid,
            11
        );
        silent.abort();
    }

    #[tokio::test]
    async fn test_build_unknown_class_fails() {
        let temp = TempDir::new().unwrap();
        let result = DaemonBuilder::new(ComponentName::new("app", "app.Missing"))
            .registry_path(temp.path().join("registry.db"))
            .announcer(LocalAnnouncer::default())
            .build()
            .await;

        assert!(matches!(result, Err(SoloError::UnknownService { .. })));
        assert!(registry(&temp).list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_started_claims_slot_and_picks_watch_target() {
        let temp = TempDir::new().unwrap();

        let daemon = match builder(&temp).pid(20).build().await.unwrap() {
            Launch::Started(daemon) => daemon,
            Launch::Ceded => panic!("empty registry should not cede"),
        };

        let entry = registry(&temp)
            .lookup(&component().service_name())
            .unwrap()
            .unwrap();
        assert_eq!((entry.pid, entry.port), (20, daemon.port()));
        assert!(!entry.discoverable);
        assert_eq!(
            daemon.watch_target(),
            &WatchTarget::Directory(temp.path().join("bin"))
        );
    }

    #[tokio::test]
    async fn test_build_cedes_to_running_holder() {
        let temp = TempDir::new().unwrap();
        let holder = Arc::new(Holder::default());
        let mut server = IpcServer::start(holder.clone()).await.unwrap();
        registry(&temp)
            .claim(&component().service_name(), 10, server.port)
            .unwrap();

        let launch = builder(&temp).pid(21).build().await.unwrap();

        assert!(matches!(launch, Launch::Ceded));
        assert_eq!(holder.broadcasts.load(Ordering::SeqCst), 1);

        server.shutdown();
    }
}
