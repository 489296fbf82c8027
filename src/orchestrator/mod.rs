//! The orchestration core: image and host registries, per-host run workers,
//! build/run coordination, and status reconciliation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::MaestroConfig;
use crate::error::{OpResult, OrchestratorError};
use crate::registry::Registry;
use crate::runtime::Connector;
use crate::types::{BuildId, HostName, ImageName};
use crate::workspace::{self, Workspace};

mod build;
mod connection;
mod dispatch;
mod image;
mod output;
mod reconciler;


pub use connection::{Connection, QueueClosed, RunQueue, RunQueueReceiver, ServerView, run_queue};
pub use image::{BuildRef, Container, ContainerStatus, ContainerView, Image, ImageState, ImageView};
pub use output::{OutputCapture, OutputSinks};
pub use reconciler::ImageRegistry;

pub type ConnectionRegistry = Registry<HostName, Arc<Connection>>;

/// Explicitly constructed orchestration context shared by every caller.
pub struct Maestro {
    workspace: Workspace,
    images: Arc<ImageRegistry>,
    connections: ConnectionRegistry,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Maestro {
    /// Populate images from the source-directory root, open a session to
    /// every configured host, and start the workers and the reconciler.
    ///
    /// Any unreadable root or failed session aborts startup.
    pub async fn start(config: &MaestroConfig, connector: &dyn Connector) -> anyhow::Result<Arc<Self>> {
        let workspace = Workspace::open(&config.internal_dir)?;

        let images = Arc::new(ImageRegistry::new());
        for name in workspace.scan().await? {
            let dir = workspace.image_dir(&name);
            images.store(name.clone(), Arc::new(Image::new(name, dir)));
        }
        info!(
            "Registered {} image(s) from {}",
            images.len(),
            workspace.root().display()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = ConnectionRegistry::new();
        let mut tasks = Vec::new();

        for (name, server) in &config.servers {
            let host = HostName::new(name.clone());
            let client = match connector.connect(&host, server).await {
                Ok(client) => client,
                Err(e) => {
                    error!("Failed to connect to server `{}`: {}", host, e);
                    let _ = shutdown.send(true);
                    for connection in connections.values() {
                        connection.client().close().await;
                    }
                    return Err(anyhow::anyhow!(
                        "Failed to connect to server `{}` ({}): {}",
                        host,
                        server.address(),
                        e
                    ));
                }
            };

            let (connection, worker) =
                Connection::spawn(host.clone(), server.clone(), client, shutdown_rx.clone());
            connections.store(host, connection);
            tasks.push(worker);
        }

        tasks.push(tokio::spawn(reconciler::run_reconciler(
            images.clone(),
            config.reconcile_interval(),
            shutdown_rx,
        )));

        Ok(Arc::new(Self {
            workspace,
            images,
            connections,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Stop the workers and the reconciler, then close every session.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        for connection in self.connections.values() {
            connection.client().close().await;
        }
    }

    pub fn images(&self) -> &ImageRegistry {
        &self.images
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn image(&self, name: &str) -> OpResult<Arc<Image>> {
        self.images
            .load(name)
            .ok_or_else(|| OrchestratorError::image_not_found(name))
    }

    pub fn connection(&self, host: &str) -> OpResult<Arc<Connection>> {
        self.connections
            .load(host)
            .ok_or_else(|| OrchestratorError::server_not_found(host))
    }

    pub async fn list_images(&self) -> BTreeMap<ImageName, ImageView> {
        let mut views = BTreeMap::new();
        for (name, image) in self.images.pairs() {
            views.insert(name, image.view().await);
        }
        views
    }

    pub async fn get_image(&self, name: &str) -> OpResult<ImageView> {
        Ok(self.image(name)?.view().await)
    }

    /// Provision a source directory and register an empty image for it.
    pub async fn create_image(&self, name: &str) -> OpResult<ImageView> {
        workspace::validate_image_name(name)?;
        if self.images.contains(name) {
            return Err(OrchestratorError::Conflict(format!(
                "Image {name} already exists"
            )));
        }

        let dir = self.workspace.create(name).await?;
        let image = Arc::new(Image::new(ImageName::new(name), dir));
        self.images.store(image.name.clone(), image.clone());
        info!("Created image {}", name);
        Ok(image.view().await)
    }

    /// Unregister an image and delete its source directory.
    pub async fn delete_image(&self, name: &str) -> OpResult<()> {
        let image = self.image(name)?;
        self.images.delete(name);

        // The directory goes while the lock is held, so a worker that already
        // accepted a run sees the removal as soon as it gets the image.
        let mut state = image.write().await;
        state.removed = true;
        state.queued = false;
        if let Some(container) = state.container.as_mut() {
            container.close_capture();
        }
        self.workspace.remove(&image.files_dir).await?;
        drop(state);

        info!("Deleted image {}", name);
        Ok(())
    }

    /// Force a (re)build of `image` on `host`. Does not start a run.
    pub async fn build(&self, image: &str, host: &str) -> OpResult<BuildId> {
        let image = self.image(image)?;
        let connection = self.connection(host)?;

        let mut state = image.write().await;
        if state.removed {
            return Err(OrchestratorError::image_not_found(image.name.as_str()));
        }
        build::build_locked(&image, &mut state, &connection).await
    }

    /// Build if necessary and queue a run of `image` on `host`.
    ///
    /// Returns once the host's worker has accepted the run. The critical
    /// section runs in its own task so that a caller going away cannot leave
    /// the image half-queued.
    pub async fn run(&self, image: &str, host: &str) -> OpResult<()> {
        let image = self.image(image)?;
        let connection = self.connection(host)?;

        tokio::spawn(dispatch::dispatch(image, connection))
            .await
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?
    }

    /// Stop the image's container and forget it.
    ///
    /// The local record is cleared even when the remote stop fails; the
    /// failure is still reported.
    pub async fn stop(&self, name: &str) -> OpResult<()> {
        let image = self.image(name)?;
        let mut state = image.write().await;

        let Some(mut container) = state.container.take() else {
            return Ok(());
        };
        container.close_capture();

        let Some(id) = container.id else {
            return Ok(());
        };

        container.connection.client().stop_container(&id).await?;
        info!("Stopped container {} of image {}", id, name);
        Ok(())
    }

    pub fn list_servers(&self) -> Vec<ServerView> {
        let mut servers: Vec<ServerView> =
            self.connections.values().iter().map(|c| c.view()).collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub async fn list_files(&self, image: &str) -> OpResult<Vec<String>> {
        let image = self.image(image)?;
        let _state = image.read().await;
        workspace::list_files(&image.files_dir).await
    }

    pub async fn write_file(&self, image: &str, file_name: &str, contents: &[u8]) -> OpResult<()> {
        let image = self.image(image)?;
        let _state = image.write().await;
        workspace::write_file(&image.files_dir, file_name, contents).await?;
        Ok(())
    }

    pub async fn file_path(&self, image: &str, file_name: &str) -> OpResult<PathBuf> {
        let image = self.image(image)?;
        workspace::existing_file(&image.files_dir, file_name).await
    }

    pub async fn delete_file(&self, image: &str, file_name: &str) -> OpResult<()> {
        let image = self.image(image)?;
        let _state = image.write().await;
        workspace::delete_file(&image.files_dir, file_name).await
    }

    /// Run a single reconciliation sweep immediately.
    pub async fn reconcile_once(&self) -> usize {
        reconciler::reconcile_once(&self.images).await
    }
}
