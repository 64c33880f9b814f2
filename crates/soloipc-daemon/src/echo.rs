//! Built-in demo service.
//!
//! The binding echoes the first bind back to the client. An intent extra
//! `"retain": true` keeps the daemon alive after its client unbinds.

use soloipc_core::{Binding, Intent, RootService, ServiceConfig, ServiceContext};
use tracing::{debug, info};

/// Class name the echo service is registered under.
pub const CLASS: &str = "soloipc.Echo";

#[derive(Debug, Default)]
pub struct EchoService {
    package: String,
    binds: u32,
    retain: bool,
}

impl RootService for EchoService {
    fn on_create(&mut self, ctx: &ServiceContext) {
        self.package = ctx.package().to_string();
        info!(
            "Echo service created for {} from {}",
            ctx.component(),
            ctx.code_path().display()
        );
    }

    fn on_bind(&mut self, intent: &Intent) -> anyhow::Result<Option<Binding>> {
        self.binds += 1;
        self.retain = wants_retain(intent);
        Ok(Some(serde_json::json!({
            "service": "echo",
            "package": self.package,
            "pid": std::process::id(),
            "action": intent.action,
            "categories": intent.categories,
        })))
    }

    fn on_rebind(&mut self, intent: &Intent) {
        self.binds += 1;
        self.retain = wants_retain(intent);
        debug!("Echo rebind #{}", self.binds);
    }

    fn on_unbind(&mut self, _intent: &Intent) -> bool {
        info!("Echo client left after {} binds, retain={}", self.binds, self.retain);
        self.retain
    }

    fn on_destroy(&mut self) {
        info!("Echo service destroyed");
    }

    fn on_config_changed(&mut self, config: &ServiceConfig) {
        debug!("Echo verbose logging: {}", config.verbose_logging);
    }
}

fn wants_retain(intent: &Intent) -> bool {
    intent
        .extras
        .other
        .get("retain")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use soloipc_core::ComponentName;
    use std::path::PathBuf;

    fn intent() -> Intent {
        Intent::new(ComponentName::new("soloipc", CLASS)).with_action("hello")
    }

    #[test]
    fn test_binding_echoes_intent() {
        let mut service = EchoService::default();
        service.on_create(&ServiceContext::new(
            ComponentName::new("soloipc", CLASS),
            PathBuf::from("/opt/soloipc/bin/soloipc-daemon"),
        ));

        let binding = service.on_bind(&intent()).unwrap().unwrap();

        assert_eq!(binding["service"], "echo");
        assert_eq!(binding["package"], "soloipc");
        assert_eq!(binding["action"], "hello");
    }

    #[test]
    fn test_retain_follows_latest_bind() {
        let mut service = EchoService::default();
        service.on_bind(&intent()).unwrap();
        assert!(!service.on_unbind(&intent()));

        let retained = intent().with_extra("retain", serde_json::json!(true));
        service.on_rebind(&retained);
        assert!(service.on_unbind(&retained));
    }
}
