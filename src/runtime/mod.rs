//! Container runtime capability used by the orchestrator.
//!
//! The orchestrator only ever talks to a host through [`RuntimeClient`]; the
//! Podman implementation lives in [`podman`], and tests substitute an
//! in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::types::{BuildId, ContainerId, HostName};

pub mod podman;
mod tunnel;

#[cfg(test)]
pub(crate) mod fake;

pub use podman::{PodmanClient, PodmanConnector};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The referenced image or container does not exist on the host.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn operation(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Coarse container state as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Running,
    Exited,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ContainerReport {
    pub state: RemoteState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One frame of a container's combined output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type OutputStream = Pin<Box<dyn Stream<Item = RuntimeResult<OutputChunk>> + Send>>;

/// Operations the orchestrator needs from one host's container runtime.
///
/// Implementations must tolerate concurrent calls: the reconciler inspects
/// while the host's worker creates and starts containers.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Build an image from `context_dir` and return its identifier.
    async fn build_image(&self, name: &str, context_dir: &Path) -> RuntimeResult<BuildId>;

    async fn remove_image(&self, id: &BuildId) -> RuntimeResult<()>;

    async fn create_container(&self, image: &BuildId, name: &str) -> RuntimeResult<ContainerId>;

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()>;

    /// Stop immediately (no grace period). A missing or already-stopped
    /// container is not an error.
    async fn stop_container(&self, id: &ContainerId) -> RuntimeResult<()>;

    /// Remove a container together with its anonymous volumes.
    async fn remove_container(&self, id: &ContainerId) -> RuntimeResult<()>;

    async fn inspect_container(&self, id: &ContainerId) -> RuntimeResult<ContainerReport>;

    /// Attach to the live stdout/stderr of a container.
    async fn attach_container(&self, id: &ContainerId) -> RuntimeResult<OutputStream>;

    /// Release the underlying session.
    async fn close(&self) {}
}

/// Opens one long-lived session per configured host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &HostName,
        server: &ServerConfig,
    ) -> RuntimeResult<Arc<dyn RuntimeClient>>;
}
