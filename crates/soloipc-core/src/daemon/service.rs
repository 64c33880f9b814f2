//! The user service contract and the factories that produce services by name.

use super::intent::{ComponentName, Intent};
use crate::error::{Result, SoloError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Handle returned from a successful bind.
pub type Binding = serde_json::Value;

/// Runtime configuration pushed to the service thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub verbose_logging: bool,
}

/// What a service can see about the daemon hosting it.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    component: ComponentName,
    code_path: PathBuf,
    config: ServiceConfig,
}

impl ServiceContext {
    pub fn new(component: ComponentName, code_path: PathBuf) -> Self {
        Self {
            component,
            code_path,
            config: ServiceConfig::default(),
        }
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    pub fn package(&self) -> &str {
        &self.component.package
    }

    /// Path of the binary the daemon was loaded from.
    pub fn code_path(&self) -> &Path {
        &self.code_path
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub(crate) fn set_config(&mut self, config: ServiceConfig) {
        self.config = config;
    }
}

/// A service hosted by the daemon.
///
/// Every callback runs on the service thread, one at a time.
pub trait RootService {
    fn on_create(&mut self, _ctx: &ServiceContext) {}

    /// First bind. The returned binding is handed to every later rebind.
    fn on_bind(&mut self, intent: &Intent) -> anyhow::Result<Option<Binding>>;

    fn on_rebind(&mut self, _intent: &Intent) {}

    /// The client went away. Return `true` to stay alive as a discoverable daemon.
    fn on_unbind(&mut self, _intent: &Intent) -> bool {
        false
    }

    fn on_destroy(&mut self) {}

    fn on_config_changed(&mut self, _config: &ServiceConfig) {}
}

/// Builds a fresh service instance.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn RootService> + Send + Sync>;

/// Service implementations by class name.
#[derive(Default, Clone)]
pub struct ServiceFactories {
    factories: HashMap<String, ServiceFactory>,
}

impl std::fmt::Debug for ServiceFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFactories")
            .field("classes", &self.classes())
            .finish()
    }
}

impl ServiceFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `class`, replacing any earlier one.
    pub fn register<F, S>(&mut self, class: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: RootService + 'static,
    {
        let class = class.into();
        debug!("Registered service factory for {}", class);
        self.factories
            .insert(class, Arc::new(move || Box::new(factory()) as Box<dyn RootService>));
        self
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Registered class names, sorted.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.keys().cloned().collect();
        classes.sort();
        classes
    }

    /// Look up the factory for `class`.
    pub fn resolve(&self, class: &str) -> Result<ServiceFactory> {
        self.factories
            .get(class)
            .cloned()
            .ok_or_else(|| SoloError::UnknownService {
                class: class.to_string(),
            })
    }
}
