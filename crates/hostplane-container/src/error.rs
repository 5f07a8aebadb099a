//! Error types for container runtime operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Docker socket not found at {0}")]
    SocketNotFound(String),

    #[error("Docker request failed: {0}")]
    RequestFailed(String),

    /// The engine answered 404 for the named object.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Docker API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response from Docker: {0}")]
    InvalidResponse(String),

    #[error("No free host port available: {0}")]
    PortUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ContainerError {
    /// Whether the engine reported the target object as missing.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;
