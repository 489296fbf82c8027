//! Image, Container and their serializable views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::{BuildId, ContainerId, HostName, ImageName};

use super::connection::Connection;
use super::output::OutputCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Queued on a host, not yet created.
    Waiting,
    Running,
    Error,
    Stopped,
    Finished,
}

impl ContainerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Stopped | Self::Finished)
    }
}

/// A named source directory plus its build and run state.
///
/// All mutable state sits behind one lock; hold the write guard for any
/// read that has to stay consistent with a following mutation.
pub struct Image {
    pub name: ImageName,
    pub files_dir: PathBuf,
    state: RwLock<ImageState>,
}

#[derive(Default)]
pub struct ImageState {
    /// Most recent successful build. The id and its host travel together.
    pub build: Option<BuildRef>,
    pub container: Option<Container>,
    /// A run has been handed to a host's queue and not yet picked up.
    pub queued: bool,
    /// Set by deletion. A queued run still holding the image must not act on it.
    pub removed: bool,
}

pub struct BuildRef {
    pub id: BuildId,
    pub connection: Arc<Connection>,
}

pub struct Container {
    /// Absent only when the runtime refused to create the container.
    pub id: Option<ContainerId>,
    pub name: String,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Host the container was created on.
    pub connection: Arc<Connection>,
    pub capture: Option<OutputCapture>,
}

impl Image {
    pub fn new(name: ImageName, files_dir: PathBuf) -> Self {
        Self {
            name,
            files_dir,
            state: RwLock::new(ImageState::default()),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ImageState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ImageState> {
        self.state.write().await
    }

    pub async fn view(&self) -> ImageView {
        let state = self.read().await;
        ImageView::new(&self.name, &state)
    }
}

impl ImageState {
    pub fn build_id(&self) -> Option<&BuildId> {
        self.build.as_ref().map(|b| &b.id)
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.build.as_ref().map(|b| &b.connection)
    }

    pub fn container_status(&self) -> Option<ContainerStatus> {
        self.container.as_ref().map(|c| c.status)
    }

    pub fn is_running(&self) -> bool {
        self.container_status() == Some(ContainerStatus::Running)
    }

    /// Whether the current build lives on `connection`'s host.
    pub fn is_built_on(&self, connection: &Connection) -> bool {
        self.connection()
            .is_some_and(|owner| owner.name == connection.name)
    }
}

impl Container {
    pub fn new(
        id: Option<ContainerId>,
        name: String,
        status: ContainerStatus,
        created_at: DateTime<Utc>,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            id,
            name,
            status,
            created_at,
            finished_at: None,
            connection,
            capture: None,
        }
    }

    /// Close the output sinks, letting buffered output drain first.
    pub fn close_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.close();
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageView {
    pub name: ImageName,
    pub build_id: Option<BuildId>,
    pub server: Option<HostName>,
    /// `waiting` while a run is queued, otherwise the container's status.
    pub status: Option<ContainerStatus>,
    pub container: Option<ContainerView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContainerView {
    pub id: Option<ContainerId>,
    pub name: String,
    pub status: ContainerStatus,
    pub server: HostName,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImageView {
    fn new(name: &ImageName, state: &ImageState) -> Self {
        let status = if state.queued {
            Some(ContainerStatus::Waiting)
        } else {
            state.container_status()
        };

        Self {
            name: name.clone(),
            build_id: state.build_id().cloned(),
            server: state.connection().map(|c| c.name.clone()),
            status,
            container: state.container.as_ref().map(|c| ContainerView {
                id: c.id.clone(),
                name: c.name.clone(),
                status: c.status,
                server: c.connection.name.clone(),
                created_at: c.created_at,
                finished_at: c.finished_at,
            }),
        }
    }
}
