//! Errors raised by container runtime adapters.
//!
//! Adapters never retry and never interpret these errors; they only
//! classify the raw failure so the layers above can decide what to do.

/// Why the runtime refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// The container or path does not exist.
    NotFound,
    /// The runtime or the container filesystem denied access.
    PermissionDenied,
    /// Any other rejection (bad parameters, conflicting state, ...).
    Invalid,
}

impl std::fmt::Display for RejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Invalid => write!(f, "invalid request"),
        }
    }
}

/// Errors that can occur during a single runtime call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime daemon could not be reached. Retryable.
    #[error("Container runtime is not available: {message}")]
    Unavailable { message: String },

    /// The runtime refused the request. Not retryable.
    #[error("Container runtime rejected request ({kind}): {message}")]
    Rejected { kind: RejectKind, message: String },
}

impl RuntimeError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a `Rejected` error of kind `Invalid`.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: RejectKind::Invalid,
            message: message.into(),
        }
    }

    /// Creates a `Rejected` error of kind `NotFound`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: RejectKind::NotFound,
            message: message.into(),
        }
    }

    /// Creates a `Rejected` error of kind `PermissionDenied`.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: RejectKind::PermissionDenied,
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if the runtime reported a missing container or path.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                kind: RejectKind::NotFound,
                ..
            }
        )
    }

    /// Returns true if the runtime reported a permission problem.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                kind: RejectKind::PermissionDenied,
                ..
            }
        )
    }

    /// Returns the human-readable detail without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Unavailable { message } | Self::Rejected { message, .. } => message,
        }
    }
}
