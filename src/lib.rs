// Core modules
mod config;
mod error;
mod registry;
mod types;
mod workspace;
pub mod api;
pub mod runtime;

pub mod orchestrator;

// Re-export key types and functions
pub use config::{MaestroConfig, ServerConfig, resolve_config_path};
pub use error::{OpResult, OrchestratorError};
pub use registry::Registry;
pub use types::{BuildId, ContainerId, HostName, ImageName};
pub use workspace::Workspace;

pub use orchestrator::{ContainerStatus, ContainerView, ImageView, Maestro, ServerView};
pub use runtime::{Connector, PodmanConnector, RuntimeClient, RuntimeError};

use anyhow::Result;
use std::sync::Arc;

/// Convenience function to start the orchestrator against real Podman hosts.
///
/// Opens one session per configured server; any unreachable server fails
/// startup.
pub async fn start_podman(config: &MaestroConfig) -> Result<Arc<Maestro>> {
    let connector = PodmanConnector::new(config.request_timeout_secs);
    Maestro::start(config, &connector).await
}
