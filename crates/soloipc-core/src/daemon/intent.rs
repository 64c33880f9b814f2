//! Component names and bind requests.

use crate::config::AppConfig;
use crate::SoloError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Identifies one service implementation inside a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub class: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Registry key for the daemon serving this component.
    pub fn service_name(&self) -> String {
        format!(
            "{}:{}/{}",
            AppConfig::SERVICE_NAME_PREFIX,
            self.package,
            self.class
        )
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

impl FromStr for ComponentName {
    type Err = SoloError;

    /// Parse `package/class`. A class starting with `.` is relative to the package.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| SoloError::Validation {
            field: "component".to_string(),
            message: format!("{} in {:?}", message, s),
        };

        let (package, class) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected package/class"))?;
        if package.is_empty() || class.is_empty() || class == "." {
            return Err(invalid("empty package or class"));
        }
        if class.contains('/') {
            return Err(invalid("class must not contain '/'"));
        }

        let class = if class.starts_with('.') {
            format!("{}{}", package, class)
        } else {
            class.to_string()
        };
        Ok(Self::new(package, class))
    }
}

/// Boolean switches and free-form values carried alongside a bind request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentExtras {
    #[serde(default)]
    pub verbose_logging: bool,
    #[serde(default)]
    pub debug_attach: bool,
    #[serde(default, flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// A bind request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub component: ComponentName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub extras: IntentExtras,
}

impl Intent {
    pub fn new(component: ComponentName) -> Self {
        Self {
            component,
            action: None,
            categories: BTreeSet::new(),
            extras: IntentExtras::default(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.insert(category.into());
        self
    }

    pub fn with_verbose_logging(mut self, enabled: bool) -> Self {
        self.extras.verbose_logging = enabled;
        self
    }

    pub fn with_debug_attach(mut self, enabled: bool) -> Self {
        self.extras.debug_attach = enabled;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.other.insert(key.into(), value);
        self
    }

    /// Copy holding only the matching-relevant fields (no extras).
    pub fn filter(&self) -> Intent {
        Intent {
            component: self.component.clone(),
            action: self.action.clone(),
            categories: self.categories.clone(),
            extras: IntentExtras::default(),
        }
    }

    /// Structural comparison on component, action and categories.
    pub fn filter_eq(&self, other: &Intent) -> bool {
        self.component == other.component
            && self.action == other.action
            && self.categories == other.categories
    }
}
