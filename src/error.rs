//! Error taxonomy shared by the sandbox, manager and client layers.
//!
//! Typed errors let the tool layer match on the failure mode (retry later,
//! fix the request, give up) instead of parsing message strings.

use crate::runtime::{RejectKind, RuntimeError};

/// Errors surfaced by sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The sandbox configuration is invalid. Never retried.
    #[error("Invalid sandbox configuration: {message}")]
    ConfigurationInvalid { message: String },

    /// The container runtime could not be reached.
    #[error("Container runtime is not available: {message}")]
    RuntimeUnavailable { message: String },

    /// The container runtime refused a request.
    #[error("Container runtime rejected request: {message}")]
    RuntimeRejected { message: String },

    /// The container could not be started, even after a retry.
    #[error("Sandbox provisioning failed: {message}")]
    ProvisioningFailed { message: String },

    /// A file or directory inside the sandbox does not exist.
    #[error("Path not found in sandbox: {path}")]
    PathNotFound { path: String },

    /// The sandbox filesystem refused access to a path.
    #[error("Permission denied in sandbox: {path}")]
    PermissionDenied { path: String },

    /// The pool is full and no sandbox is idle enough to evict.
    #[error("Sandbox capacity exceeded: all {capacity} sandboxes are busy")]
    CapacityExceeded { capacity: usize },

    /// The sandbox was already removed.
    #[error("Sandbox {id} is closed")]
    SandboxClosed { id: String },

    /// A caller-supplied argument was rejected before reaching the sandbox.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The terminal stream broke while a command was running.
    #[error("Command execution failed: {message}")]
    ExecutionFailed { message: String },

    /// A host-side filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Creates a `ConfigurationInvalid` error.
    pub fn configuration_invalid(message: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            message: message.into(),
        }
    }

    /// Creates a `ProvisioningFailed` error.
    pub fn provisioning_failed(message: impl Into<String>) -> Self {
        Self::ProvisioningFailed {
            message: message.into(),
        }
    }

    /// Creates a `SandboxClosed` error.
    pub fn closed(id: impl Into<String>) -> Self {
        Self::SandboxClosed { id: id.into() }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an `ExecutionFailed` error.
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Creates an `Io` error for a host path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Translates an adapter error raised by a file operation on `path`.
    pub fn from_file_op(path: &str, err: RuntimeError) -> Self {
        match err {
            RuntimeError::Rejected {
                kind: RejectKind::NotFound,
                ..
            } => Self::PathNotFound {
                path: path.to_string(),
            },
            RuntimeError::Rejected {
                kind: RejectKind::PermissionDenied,
                ..
            } => Self::PermissionDenied {
                path: path.to_string(),
            },
            other => other.into(),
        }
    }

    /// Returns true if the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RuntimeUnavailable { .. } | Self::CapacityExceeded { .. }
        )
    }

    /// Returns true if the sandbox was already removed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::SandboxClosed { .. })
    }

    /// Returns true if the pool had no room.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

impl From<RuntimeError> for SandboxError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable { message } => Self::RuntimeUnavailable { message },
            RuntimeError::Rejected { message, .. } => Self::RuntimeRejected { message },
        }
    }
}
