//! Error types for soloipc.
//!
//! One error enum covers the transport, the registry, the self-watch and the
//! daemon state machine. RPC-facing code maps it onto JSON-RPC error codes.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the soloipc library.
#[derive(Debug, Error)]
pub enum SoloError {
    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File watch error: {message}")]
    Watch {
        message: String,
        #[source]
        source: Option<notify::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Transport errors
    #[error("Service instance lost (PID {pid}, port {port})")]
    InstanceLost { pid: u32, port: u16 },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    // Daemon errors
    #[error("No service registered for class {class}")]
    UnknownService { class: String },

    #[error("Component mismatch: daemon serves {expected}, request targets {actual}")]
    ComponentMismatch { expected: String, actual: String },

    #[error("Registry slot for {service} could not be claimed: {message}")]
    ClaimFailed { service: String, message: String },

    #[error("Service callback failed: {message}")]
    Callback { message: String },

    #[error("Daemon is terminating")]
    Terminated,

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// JSON-RPC code for "this endpoint is not the service you asked for".
pub(crate) const COMPONENT_MISMATCH_CODE: i32 = -32001;

/// Result type alias for soloipc operations.
pub type Result<T> = std::result::Result<T, SoloError>;

impl From<std::io::Error> for SoloError {
    fn from(err: std::io::Error) -> Self {
        SoloError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for SoloError {
    fn from(err: serde_json::Error) -> Self {
        SoloError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for SoloError {
    fn from(err: rusqlite::Error) -> Self {
        SoloError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<notify::Error> for SoloError {
    fn from(err: notify::Error) -> Self {
        SoloError::Watch {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl SoloError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        SoloError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Instance lost
    /// - -32001: Unknown service / component mismatch
    /// - -32002: Daemon terminating
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            SoloError::MethodNotFound { .. } => -32601,
            SoloError::InvalidParams { .. } => -32602,
            SoloError::InstanceLost { .. } => -32000,
            SoloError::UnknownService { .. } | SoloError::ComponentMismatch { .. } => {
                COMPONENT_MISMATCH_CODE
            }
            SoloError::Terminated | SoloError::Cancelled => -32002,
            SoloError::Validation { .. } => -32005,
            SoloError::Remote { code, .. } => *code,
            _ => -32603,
        }
    }

    /// Whether the error means the remote endpoint is gone.
    pub fn is_instance_lost(&self) -> bool {
        matches!(self, SoloError::InstanceLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SoloError::InstanceLost { pid: 42, port: 9000 };
        assert_eq!(err.to_string(), "Service instance lost (PID 42, port 9000)");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            SoloError::MethodNotFound {
                method: "nope".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(SoloError::Terminated.to_rpc_error_code(), -32002);
        assert_eq!(
            SoloError::Remote {
                code: -32005,
                message: "bad".into()
            }
            .to_rpc_error_code(),
            -32005
        );
        assert_eq!(SoloError::Other("x".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_instance_lost_detection() {
        assert!(SoloError::InstanceLost { pid: 1, port: 1 }.is_instance_lost());
        assert!(!SoloError::Terminated.is_instance_lost());
    }
}
