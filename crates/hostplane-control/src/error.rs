//! Error types for hostplane-control.

use std::fmt;
use std::time::Duration;

use hostplane_container::ContainerError;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// External subsystem a provider error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Tenant database engine.
    Database,
    /// Container runtime.
    Container,
    /// DNS provider or resolver.
    Dns,
    /// Certificate issuer.
    Certificate,
    /// Reverse proxy.
    Proxy,
    /// Local filesystem.
    Filesystem,
}

impl Provider {
    /// Get the provider name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Container => "container",
            Self::Dns => "dns",
            Self::Certificate => "certificate",
            Self::Proxy => "proxy",
            Self::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    // =========================================================================
    // Validation errors (raised before any side effect)
    // =========================================================================
    /// A referenced resource does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource kind (site, domain, database, ...).
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Request failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Request conflicts with existing state (duplicate names and the like).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another workflow is already running for the site.
    #[error("site {site_id} is busy with a {workflow} workflow")]
    SiteBusy {
        /// Site identifier.
        site_id: String,
        /// Workflow currently holding the site.
        workflow: &'static str,
    },

    /// The site has no container to operate on.
    #[error("site {0} is not provisioned")]
    NotProvisioned(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    // =========================================================================
    // Provider errors
    // =========================================================================
    /// An external subsystem rejected or failed an operation.
    #[error("{provider} provider error: {message}")]
    Provider {
        /// Subsystem that failed.
        provider: Provider,
        /// Failure description.
        message: String,
    },

    /// An external process exited unsuccessfully.
    #[error("{program} failed (exit code {}): {stderr}", .exit_code.map_or_else(|| "none".to_owned(), |c| c.to_string()))]
    Process {
        /// Program that was run.
        program: String,
        /// Exit code, absent when killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// An operation exceeded its time limit.
    #[error("{operation} timed out after {limit:?}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// The limit that was exceeded.
        limit: Duration,
    },

    // =========================================================================
    // Infrastructure errors
    // =========================================================================
    /// Ledger database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Create a provider error.
    #[must_use]
    pub fn provider(provider: Provider, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider,
            message: msg.into(),
        }
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error means the target resource is missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<ContainerError> for ControlError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::NotFound { kind, id } => Self::NotFound { resource: kind, id },
            other => Self::provider(Provider::Container, other.to_string()),
        }
    }
}
