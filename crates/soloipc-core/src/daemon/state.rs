//! Daemon state and IPC dispatch.
//!
//! One mutex serializes the bind, unbind and stop transitions. Service
//! callbacks never run under it directly: a transition posts them to the
//! service thread and waits. The service thread itself only ever try-locks,
//! so a transition waiting on it can never deadlock against it.

use super::announce::{Announcement, Announcer};
use super::intent::{ComponentName, Intent};
use super::looper::{LoopContext, LoopHandle, Looper};
use super::service::{Binding, ServiceConfig, ServiceContext, ServiceFactory};
use super::watch::{SelfWatch, WatchTarget};
use crate::cancel::CancellationToken;
use crate::config::DaemonConfig;
use crate::ipc::{methods, ClientHandle, DeathLink, IpcDispatch, IpcServerHandle};
use crate::platform::{set_process_name, wait_for_debugger_with};
use crate::registry::ServiceRegistry;
use crate::{Result, SoloError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use tracing::{debug, error, info, warn};

/// Called with the requested verbosity on every bind.
pub type VerbosityHook = Arc<dyn Fn(bool) + Send + Sync>;

/// Reports whether a debugger is attached.
pub type DebuggerCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Snapshot returned by the `status` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub service: String,
    pub pid: u32,
    pub port: u16,
    pub bound: bool,
    pub discoverable: bool,
}

struct AttachedClient {
    handle: ClientHandle,
    link: DeathLink,
}

#[derive(Default)]
struct DaemonState {
    client: Option<AttachedClient>,
    /// Filtered first-bind intent. Survives unbind and is never replaced by a rebind.
    last_intent: Option<Intent>,
    binding: Option<Binding>,
    terminated: bool,
}

impl DaemonState {
    fn detach_client(&mut self) {
        if let Some(attached) = self.client.take() {
            debug!("Detaching client {}", attached.handle.id());
            attached.link.unlink();
        }
    }

    fn bound_client(&self) -> Option<u64> {
        self.client.as_ref().map(|attached| attached.handle.id())
    }
}

pub(crate) struct DaemonCore {
    component: ComponentName,
    service_name: String,
    pid: u32,
    port: u16,
    state: Mutex<DaemonState>,
    looper: LoopHandle,
    registry: ServiceRegistry,
    announcer: Arc<dyn Announcer>,
    verbosity_hook: Option<VerbosityHook>,
    debugger_check: DebuggerCheck,
    cancel: CancellationToken,
    discoverable: AtomicBool,
}

impl DaemonCore {
    pub(super) fn new(
        component: ComponentName,
        pid: u32,
        port: u16,
        looper: LoopHandle,
        registry: ServiceRegistry,
        announcer: Arc<dyn Announcer>,
    ) -> Self {
        Self {
            service_name: component.service_name(),
            component,
            pid,
            port,
            state: Mutex::new(DaemonState::default()),
            looper,
            registry,
            announcer,
            verbosity_hook: None,
            debugger_check: Arc::new(crate::platform::is_debugger_attached),
            cancel: CancellationToken::new(),
            discoverable: AtomicBool::new(false),
        }
    }

    pub(super) fn with_verbosity_hook(mut self, hook: Option<VerbosityHook>) -> Self {
        self.verbosity_hook = hook;
        self
    }

    pub(super) fn with_debugger_check(mut self, check: Option<DebuggerCheck>) -> Self {
        if let Some(check) = check {
            self.debugger_check = check;
        }
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, DaemonState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach `client` and run the first-bind or rebind callback.
    pub(crate) fn bind(self: &Arc<Self>, intent: Intent, client: ClientHandle) -> Option<Binding> {
        if intent.component != self.component {
            error!(
                "Bind for {} reached the daemon for {}, exiting",
                intent.component, self.component
            );
            self.cancel.cancel();
            self.looper.exit(DaemonConfig::EXIT_FAILURE);
            return None;
        }

        info!("{} bind from client {}", self.component, client.id());
        self.apply_verbosity(intent.extras.verbose_logging);

        if intent.extras.debug_attach {
            if let Err(e) = self.await_debugger() {
                warn!("Debugger wait ended without a debugger: {}", e);
                return None;
            }
        }

        let mut state = self.lock_state();
        if state.terminated {
            debug!("Ignoring bind from client {} after stop", client.id());
            return None;
        }

        state.detach_client();
        let link = self.link_client(&client);
        state.client = Some(AttachedClient {
            handle: client,
            link,
        });

        if let Some(first) = &state.last_intent {
            if !first.filter_eq(&intent) {
                debug!(
                    "Rebind of {} with a different filter than the first bind",
                    self.component
                );
            }
            let cached = state.binding.clone();
            return match self
                .looper
                .post_and_wait(move |cx| cx.service().on_rebind(&intent))
            {
                Ok(()) => cached,
                Err(e) => {
                    error!("Rebind of {} failed: {}", self.component, e);
                    None
                }
            };
        }

        state.last_intent = Some(intent.filter());
        let outcome = self
            .looper
            .post_and_wait(move |cx| cx.service().on_bind(&intent))
            .and_then(|result| {
                result.map_err(|e| SoloError::Callback {
                    message: format!("{:#}", e),
                })
            });

        match outcome {
            Ok(binding) => {
                state.binding = binding.clone();
                binding
            }
            Err(e) => {
                error!("First bind of {} failed: {}", self.component, e);
                state.detach_client();
                state.last_intent = None;
                None
            }
        }
    }

    /// Negotiated disconnect by `caller`.
    ///
    /// Only the bound client can unbind. The service decides whether the
    /// daemon exits or stays discoverable.
    pub(crate) fn unbind(&self, caller: u64) {
        let mut state = self.lock_state();
        if state.terminated {
            return;
        }
        match state.bound_client() {
            Some(id) if id == caller => {}
            Some(id) => {
                warn!("Ignoring unbind from client {}: client {} is bound", caller, id);
                return;
            }
            None => {
                debug!("Ignoring unbind from client {}: no client bound", caller);
                return;
            }
        }

        info!("{} unbind", self.component);
        state.detach_client();

        let Some(intent) = state.last_intent.clone() else {
            return;
        };
        let retained = self.looper.post_and_wait(move |cx| {
            let retain = cx.service().on_unbind(&intent);
            if !retain {
                cx.service().on_destroy();
                cx.exit(DaemonConfig::EXIT_SUCCESS);
            }
            retain
        });

        match retained {
            Ok(true) => match self.registry.register(&self.service_name, self.pid, self.port) {
                Ok(()) => {
                    self.discoverable.store(true, Ordering::SeqCst);
                    info!("{} retained and discoverable on port {}", self.component, self.port);
                }
                Err(e) => error!("Failed to register {} as discoverable: {}", self.service_name, e),
            },
            Ok(false) => {
                state.terminated = true;
                self.cancel.cancel();
            }
            Err(e) => error!("Unbind of {} failed: {}", self.component, e),
        }
    }

    fn client_died(&self, id: u64) {
        info!("{} client {} died", self.component, id);
        self.unbind(id);
    }

    /// Forced shutdown from any state.
    pub(crate) fn stop(&self) {
        let mut state = self.lock_state();
        if state.terminated {
            debug!("{} already stopping", self.component);
            return;
        }
        info!("{} stop", self.component);
        self.mark_terminated(&mut state);

        let posted = self.looper.post(|cx| {
            cx.service().on_destroy();
            cx.exit(DaemonConfig::EXIT_SUCCESS);
        });
        if let Err(e) = posted {
            debug!("Stop found the service loop gone: {}", e);
        }
    }

    /// Stop requested from the service thread (self-watch).
    ///
    /// Never blocks on the transition lock: if a transition holds it, that
    /// transition may be waiting on this very thread, so the request is
    /// re-queued behind it instead.
    pub(crate) fn stop_on_service_thread(core: Arc<Self>, cx: &mut LoopContext) {
        let mut state = match core.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                thread::sleep(DaemonConfig::STOP_RETRY_INTERVAL);
                let again = core.clone();
                if cx
                    .handle()
                    .post(move |cx| DaemonCore::stop_on_service_thread(again, cx))
                    .is_err()
                {
                    debug!("Service loop already exiting");
                }
                return;
            }
        };
        if state.terminated {
            return;
        }
        info!("{} binary changed, stopping", core.component);
        core.mark_terminated(&mut state);
        drop(state);

        cx.service().on_destroy();
        cx.exit(DaemonConfig::EXIT_SUCCESS);
    }

    fn mark_terminated(&self, state: &mut DaemonState) {
        state.detach_client();
        state.terminated = true;
        self.cancel.cancel();
    }

    /// Send a discovery announcement. Touches no daemon state.
    pub(crate) fn broadcast(&self) -> Result<()> {
        let announcement = Announcement {
            pid: self.pid,
            ..Announcement::new(&self.component, self.port)
        };
        self.announcer.send(&announcement)?;
        debug!("Broadcast {} on port {}", self.service_name, self.port);
        Ok(())
    }

    /// Fail unless this daemon is `service` running as `pid` (when given).
    fn check_identity(&self, service: Option<&str>, pid: Option<u32>) -> Result<()> {
        if let Some(service) = service.filter(|s| *s != self.service_name) {
            warn!(
                "Re-announce for {} reached the daemon for {}",
                service, self.service_name
            );
            return Err(SoloError::ComponentMismatch {
                expected: self.service_name.clone(),
                actual: service.to_string(),
            });
        }
        if let Some(pid) = pid.filter(|p| *p != self.pid) {
            warn!(
                "Re-announce for PID {} reached {} running as PID {}",
                pid, self.service_name, self.pid
            );
            return Err(SoloError::ComponentMismatch {
                expected: format!("{} (PID {})", self.service_name, self.pid),
                actual: format!("{} (PID {})", self.service_name, pid),
            });
        }
        Ok(())
    }

    pub(crate) fn status(&self) -> DaemonStatus {
        let state = self.lock_state();
        DaemonStatus {
            service: self.service_name.clone(),
            pid: self.pid,
            port: self.port,
            bound: state.client.is_some(),
            discoverable: self.discoverable.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn last_intent(&self) -> Option<Intent> {
        self.lock_state().last_intent.clone()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.lock_state().terminated
    }

    /// Final cleanup once the service loop has returned.
    fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            self.mark_terminated(&mut state);
        }
        match self.registry.unregister(&self.service_name, self.pid) {
            Ok(true) => debug!("Released registry slot {}", self.service_name),
            Ok(false) => {}
            Err(e) => warn!("Failed to release registry slot {}: {}", self.service_name, e),
        }
    }

    fn link_client(self: &Arc<Self>, client: &ClientHandle) -> DeathLink {
        let core = Arc::downgrade(self);
        let id = client.id();
        client.link_to_death(move || {
            if let Some(core) = core.upgrade() {
                tokio::task::spawn_blocking(move || core.client_died(id));
            }
        })
    }

    fn apply_verbosity(&self, verbose: bool) {
        if let Some(hook) = &self.verbosity_hook {
            hook(verbose);
        }
        let config = ServiceConfig {
            verbose_logging: verbose,
        };
        if let Err(e) = self.looper.post(move |cx| cx.apply_config(config)) {
            debug!("Verbosity update dropped: {}", e);
        }
    }

    fn await_debugger(&self) -> Result<()> {
        let name = format!(
            "{}{}",
            self.component.package,
            DaemonConfig::DEBUG_PROCESS_SUFFIX
        );
        if let Err(e) = set_process_name(&name) {
            warn!("Failed to rename process to {}: {}", name, e);
        }
        info!("Waiting for a debugger to attach to PID {}", std::process::id());
        let check = self.debugger_check.clone();
        wait_for_debugger_with(DaemonConfig::DEBUGGER_POLL_INTERVAL, &self.cancel, move || {
            check()
        })
    }
}

/// Routes calls on the daemon endpoint to the state machine.
pub(crate) struct DaemonEndpoint {
    core: Arc<DaemonCore>,
}

impl DaemonEndpoint {
    pub(super) fn new(core: Arc<DaemonCore>) -> Self {
        Self { core }
    }
}

#[derive(Deserialize)]
struct BindParams {
    intent: Intent,
}

/// Optional identity a re-announce request expects this daemon to have.
#[derive(Default, Deserialize)]
#[serde(default)]
struct BroadcastParams {
    service: Option<String>,
    pid: Option<u32>,
}

async fn blocking<F, R>(task: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| SoloError::Other(format!("Daemon task failed: {}", e)))
}

#[async_trait::async_trait]
impl IpcDispatch for DaemonEndpoint {
    async fn dispatch(
        &self,
        client: &ClientHandle,
        method: &str,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, SoloError> {
        match method {
            methods::BIND => {
                let BindParams { intent } =
                    serde_json::from_value(params).map_err(|e| SoloError::InvalidParams {
                        message: format!("Invalid bind request: {e}"),
                    })?;
                let core = self.core.clone();
                let client = client.clone();
                let binding = blocking(move || core.bind(intent, client)).await?;
                Ok(binding.unwrap_or(serde_json::Value::Null))
            }
            methods::UNBIND => {
                let core = self.core.clone();
                let caller = client.id();
                blocking(move || core.unbind(caller)).await?;
                Ok(serde_json::Value::Null)
            }
            methods::STOP => {
                let core = self.core.clone();
                blocking(move || core.stop()).await?;
                Ok(serde_json::Value::Null)
            }
            methods::BROADCAST => {
                let BroadcastParams { service, pid } =
                    serde_json::from_value(params).map_err(|e| SoloError::InvalidParams {
                        message: format!("Invalid broadcast request: {e}"),
                    })?;
                self.core.check_identity(service.as_deref(), pid)?;
                let core = self.core.clone();
                blocking(move || core.broadcast()).await??;
                Ok(serde_json::Value::Bool(true))
            }
            methods::PING => Ok(serde_json::json!("pong")),
            methods::STATUS => {
                let core = self.core.clone();
                let status = blocking(move || core.status()).await?;
                Ok(serde_json::to_value(status)?)
            }
            _ => Err(SoloError::MethodNotFound {
                method: method.to_string(),
            }),
        }
    }

    async fn terminate(&self) {
        let core = self.core.clone();
        if let Err(e) = blocking(move || core.stop()).await {
            error!("Terminate failed: {}", e);
        }
    }
}

/// Cloneable control handle for a daemon, usable while it runs.
#[derive(Clone)]
pub struct DaemonHandle {
    core: Arc<DaemonCore>,
}

impl DaemonHandle {
    /// Forced shutdown. Blocks briefly on the transition lock.
    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn status(&self) -> DaemonStatus {
        self.core.status()
    }

    pub fn broadcast(&self) -> Result<()> {
        self.core.broadcast()
    }

    /// Filtered intent of the first bind, if any.
    pub fn last_intent(&self) -> Option<Intent> {
        self.core.last_intent()
    }

    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }
}

/// A daemon that won arbitration and is ready to run.
pub struct ServiceDaemon {
    core: Arc<DaemonCore>,
    looper: Looper,
    factory: ServiceFactory,
    context: ServiceContext,
    watch_target: WatchTarget,
    server: IpcServerHandle,
}

impl ServiceDaemon {
    pub(super) fn new(
        core: Arc<DaemonCore>,
        looper: Looper,
        factory: ServiceFactory,
        context: ServiceContext,
        watch_target: WatchTarget,
        server: IpcServerHandle,
    ) -> Self {
        Self {
            core,
            looper,
            factory,
            context,
            watch_target,
            server,
        }
    }

    pub fn component(&self) -> &ComponentName {
        &self.core.component
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn port(&self) -> u16 {
        self.core.port
    }

    pub fn watch_target(&self) -> &WatchTarget {
        &self.watch_target
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            core: self.core.clone(),
        }
    }

    /// Run the service thread on the calling thread until a stop condition.
    ///
    /// Creates the service, arms the self-watch, sends the initial
    /// announcement, then serves. Returns the process exit status.
    pub fn run(self) -> i32 {
        let Self {
            core,
            looper,
            factory,
            context,
            watch_target,
            mut server,
        } = self;

        let watch_slot: Arc<Mutex<Option<SelfWatch>>> = Arc::default();
        let slot = watch_slot.clone();
        let startup_core = core.clone();
        let startup = looper.handle().post(move |cx| {
            let watch_core = startup_core.clone();
            let loop_handle = cx.handle().clone();
            let armed = SelfWatch::arm(watch_target, move |_event| {
                let core = watch_core.clone();
                if loop_handle
                    .post(move |cx| DaemonCore::stop_on_service_thread(core, cx))
                    .is_err()
                {
                    debug!("Self-watch event after exit");
                }
            });
            match armed {
                Ok(watch) => {
                    *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(watch);
                }
                Err(e) => warn!("Failed to arm self-watch: {}", e),
            }

            if let Err(e) = startup_core.broadcast() {
                warn!("Initial announcement failed: {}", e);
            }
        });
        if let Err(e) = startup {
            debug!("Daemon stopped before startup: {}", e);
        }

        info!("{} serving on port {}", core.component, core.port);
        let status = looper.run(factory, context);

        watch_slot.lock().unwrap_or_else(|p| p.into_inner()).take();
        core.shutdown();
        server.shutdown();
        info!("{} exiting with status {}", core.component, status);
        status
    }
}
