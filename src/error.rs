//! Typed outcomes of orchestration operations.
//!
//! The HTTP adapter maps these onto status codes; nothing in the core turns
//! them into process-ending conditions.

use crate::runtime::RuntimeError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Unknown image, host, or file.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// The request conflicts with current state (already running, already exists).
    #[error("{0}")]
    Conflict(String),

    /// A name that cannot be used as a single path component.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The remote build step failed.
    #[error("Failed to build image {image} on server {host}: {source}")]
    Build {
        image: String,
        host: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The host's worker is gone and no longer accepts runs.
    #[error("Run queue for server {0} is closed")]
    QueueClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type OpResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn image_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Image",
            name: name.into(),
        }
    }

    pub fn server_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "Server",
            name: name.into(),
        }
    }

    pub fn file_not_found(name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "File",
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
