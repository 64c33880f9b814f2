//! The service thread.
//!
//! A single consumer drains a task queue and owns the service instance. All
//! lifecycle callbacks run here, one at a time, in post order. Other threads
//! talk to it through a cloneable [`LoopHandle`].

use super::service::{RootService, ServiceConfig, ServiceContext, ServiceFactory};
use crate::config::DaemonConfig;
use crate::{Result, SoloError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};
use tracing::{debug, error, info, warn};

type Task = Box<dyn FnOnce(&mut LoopContext) + Send>;

enum Message {
    Run(Task),
    Wake,
}

#[derive(Debug, Default)]
struct LoopShared {
    exit_status: Mutex<Option<i32>>,
    thread: OnceLock<ThreadId>,
}

impl LoopShared {
    fn status(&self) -> MutexGuard<'_, Option<i32>> {
        self.exit_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Posts work to the service thread and requests its exit.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::Sender<Message>,
    shared: Arc<LoopShared>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("exit_status", &self.exit_status())
            .finish_non_exhaustive()
    }
}

impl LoopHandle {
    /// Queue `task` without waiting for it.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        if self.is_exiting() {
            return Err(SoloError::Terminated);
        }
        self.tx
            .send(Message::Run(Box::new(task)))
            .map_err(|_| SoloError::Terminated)
    }

    /// Queue `task` and block until it has run, returning its result.
    ///
    /// A panic inside `task` surfaces as [`SoloError::Callback`]. Work dropped
    /// because the loop exited surfaces as [`SoloError::Terminated`]. Calling
    /// this from the service thread is refused since it would wait on itself.
    pub fn post_and_wait<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce(&mut LoopContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_service_thread() {
            return Err(SoloError::Other(
                "post_and_wait called on the service thread".to_string(),
            ));
        }

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.post(move |cx| {
            let outcome = catch_unwind(AssertUnwindSafe(|| task(cx)));
            let _ = done_tx.send(outcome.map_err(panic_message));
        })?;

        match done_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(SoloError::Callback { message }),
            Err(_) => Err(SoloError::Terminated),
        }
    }

    /// Ask the loop to stop with `status`. The first request wins; queued
    /// work is dropped and later posts are refused.
    pub fn exit(&self, status: i32) {
        {
            let mut current = self.shared.status();
            if current.is_some() {
                return;
            }
            *current = Some(status);
        }
        info!("Service loop exit requested with status {}", status);
        let _ = self.tx.send(Message::Wake);
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.shared.status()
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Whether the caller is running on the service thread.
    pub fn is_service_thread(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }
}

/// What a task sees while running on the service thread.
pub struct LoopContext {
    service: Box<dyn RootService>,
    context: ServiceContext,
    handle: LoopHandle,
}

impl LoopContext {
    pub fn service(&mut self) -> &mut dyn RootService {
        self.service.as_mut()
    }

    pub fn context(&self) -> &ServiceContext {
        &self.context
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Replace the service configuration and tell the service about it.
    pub fn apply_config(&mut self, config: ServiceConfig) {
        if *self.context.config() == config {
            return;
        }
        debug!("Service config changed: {:?}", config);
        self.context.set_config(config.clone());
        self.service.on_config_changed(&config);
    }

    pub fn exit(&self, status: i32) {
        self.handle.exit(status);
    }
}

/// The task queue consumed by the service thread.
pub struct Looper {
    rx: mpsc::Receiver<Message>,
    handle: LoopHandle,
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

impl Looper {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            handle: LoopHandle {
                tx,
                shared: Arc::new(LoopShared::default()),
            },
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Create the service on the calling thread and process tasks until exit.
    ///
    /// Tasks posted before `run` are processed after `on_create`. Returns the
    /// exit status.
    pub fn run(self, factory: ServiceFactory, context: ServiceContext) -> i32 {
        let _ = self.handle.shared.thread.set(thread::current().id());

        let created = catch_unwind(AssertUnwindSafe(|| {
            let mut service = factory();
            service.on_create(&context);
            service
        }));
        let service = match created {
            Ok(service) => service,
            Err(payload) => {
                error!("Service creation panicked: {}", panic_message(payload));
                self.handle.exit(DaemonConfig::EXIT_FAILURE);
                return DaemonConfig::EXIT_FAILURE;
            }
        };

        let mut cx = LoopContext {
            service,
            context,
            handle: self.handle.clone(),
        };

        loop {
            if let Some(status) = self.handle.exit_status() {
                debug!("Service loop finished with status {}", status);
                return status;
            }
            match self.rx.recv() {
                Ok(Message::Run(task)) => {
                    if self.handle.is_exiting() {
                        continue;
                    }
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(&mut cx))) {
                        warn!("Service task panicked: {}", panic_message(payload));
                    }
                }
                Ok(Message::Wake) => {}
                Err(_) => return DaemonConfig::EXIT_SUCCESS,
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
