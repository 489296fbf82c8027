//! One live session per host, its run queue, and the worker draining it.
//!
//! The queue is a rendezvous: [`RunQueue::push`] returns only after the
//! worker has dequeued the item, so dispatch latency is bounded by worker
//! availability. Items for one host are processed strictly in order, one at
//! a time; different hosts proceed in parallel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{OpResult, OrchestratorError};
use crate::runtime::RuntimeClient;
use crate::types::{HostName, ImageName};

use super::image::{Container, ContainerStatus, Image};
use super::output::{OutputCapture, OutputSinks};

struct RunTicket {
    image: Arc<Image>,
    accepted: oneshot::Sender<()>,
}

/// Producer side of a host's run queue.
#[derive(Clone)]
pub struct RunQueue {
    tx: mpsc::Sender<RunTicket>,
}

/// Single consumer side of a host's run queue.
pub struct RunQueueReceiver {
    rx: mpsc::Receiver<RunTicket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

pub fn run_queue() -> (RunQueue, RunQueueReceiver) {
    // One slot for the hand-off; the acceptance handshake removes the buffering.
    let (tx, rx) = mpsc::channel(1);
    (RunQueue { tx }, RunQueueReceiver { rx })
}

impl RunQueue {
    /// Hand `image` to the worker, waiting until it has been dequeued.
    pub async fn push(&self, image: Arc<Image>) -> Result<(), QueueClosed> {
        let (accepted, on_accept) = oneshot::channel();
        self.tx
            .send(RunTicket { image, accepted })
            .await
            .map_err(|_| QueueClosed)?;
        on_accept.await.map_err(|_| QueueClosed)
    }
}

impl RunQueueReceiver {
    pub async fn recv(&mut self) -> Option<Arc<Image>> {
        let ticket = self.rx.recv().await?;
        // The producer may have gone away; the run still proceeds.
        let _ = ticket.accepted.send(());
        Some(ticket.image)
    }
}

pub struct Connection {
    pub name: HostName,
    pub server: ServerConfig,
    client: Arc<dyn RuntimeClient>,
    queue: RunQueue,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerView {
    pub name: HostName,
    pub address: String,
}

impl Connection {
    /// Create the connection and spawn its worker.
    pub fn spawn(
        name: HostName,
        server: ServerConfig,
        client: Arc<dyn RuntimeClient>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (queue, receiver) = run_queue();
        let connection = Arc::new(Self {
            name,
            server,
            client,
            queue,
        });
        let handle = tokio::spawn(worker_loop(connection.clone(), receiver, shutdown));
        (connection, handle)
    }

    pub fn client(&self) -> &Arc<dyn RuntimeClient> {
        &self.client
    }

    pub async fn enqueue(&self, image: Arc<Image>) -> OpResult<()> {
        self.queue
            .push(image)
            .await
            .map_err(|_| OrchestratorError::QueueClosed(self.name.to_string()))
    }

    pub fn view(&self) -> ServerView {
        ServerView {
            name: self.name.clone(),
            address: self.server.address(),
        }
    }
}

async fn worker_loop(
    connection: Arc<Connection>,
    mut receiver: RunQueueReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Run worker for server `{}` started", connection.name);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            image = receiver.recv() => match image {
                Some(image) => create_and_start(&connection, &image).await,
                None => break,
            },
        }
    }

    info!("Run worker for server `{}` stopped", connection.name);
}

/// Create, start and attach one queued image, all under its exclusive lock.
async fn create_and_start(connection: &Arc<Connection>, image: &Image) {
    let mut state = image.write().await;
    state.queued = false;

    if state.removed || !tokio::fs::try_exists(&image.files_dir).await.unwrap_or(false) {
        info!(
            "Image {} was deleted before its run on `{}` started; skipping",
            image.name, connection.name
        );
        return;
    }

    let Some(build_id) = state.build_id().cloned() else {
        warn!(
            "Image {} was queued on `{}` without a build; skipping",
            image.name, connection.name
        );
        return;
    };

    let created_at = Utc::now();
    let name = container_name(&image.name, created_at);

    let id = match connection.client.create_container(&build_id, &name).await {
        Ok(id) => id,
        Err(e) => {
            error!(
                "Failed to create container {} for image {} on `{}`: {}",
                name, image.name, connection.name, e
            );
            state.container = Some(Container::new(
                None,
                name,
                ContainerStatus::Error,
                created_at,
                connection.clone(),
            ));
            return;
        }
    };

    let sinks = match OutputSinks::open(&image.files_dir, &name).await {
        Ok(sinks) => sinks,
        Err(e) => {
            error!("Failed to open output files for {}: {}", name, e);
            state.container = Some(Container::new(
                Some(id),
                name,
                ContainerStatus::Error,
                created_at,
                connection.clone(),
            ));
            return;
        }
    };

    let container = state.container.insert(Container::new(
        Some(id.clone()),
        name,
        ContainerStatus::Running,
        created_at,
        connection.clone(),
    ));

    if let Err(e) = connection.client.start_container(&id).await {
        error!("Failed to start container {}: {}", container.name, e);
        container.status = ContainerStatus::Error;
        return;
    }

    match connection.client.attach_container(&id).await {
        Ok(stream) => {
            container.capture = Some(OutputCapture::spawn(container.name.clone(), stream, sinks));
            debug!("Attached to container {} ({})", container.name, id);
        }
        Err(e) => {
            error!("Failed to attach to container {}: {}", container.name, e);
            container.status = ContainerStatus::Error;
        }
    }

    info!(
        "Container {} for image {} is {:?} on `{}`",
        container.name, image.name, container.status, connection.name
    );
}

fn container_name(image: &ImageName, at: DateTime<Utc>) -> String {
    format!("maestro-{}-{}", image, at.format("%Y%m%d-%H%M%S-%3f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::time::Duration;

    fn image(name: &str) -> Arc<Image> {
        Arc::new(Image::new(ImageName::new(name), PathBuf::from("/nonexistent")))
    }

    #[test]
    fn test_container_name_from_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            container_name(&ImageName::new("demo"), at),
            "maestro-demo-20240309-140507-000"
        );
    }

    #[tokio::test]
    async fn test_push_blocks_until_dequeued() {
        let (queue, mut receiver) = run_queue();

        let pending = tokio::time::timeout(Duration::from_millis(50), queue.push(image("a"))).await;
        assert!(pending.is_err(), "push must wait for the consumer");

        // The timed-out push left its ticket behind; drain it first.
        assert_eq!(receiver.recv().await.unwrap().name.as_str(), "a");

        let producer = tokio::spawn({
            let queue = queue.clone();
            async move { queue.push(image("b")).await }
        });
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.name.as_str(), "b");
        assert_eq!(producer.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_queue_is_fifo_across_producers() {
        let (queue, mut receiver) = run_queue();

        let mut producers = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move { queue.push(image(name)).await }));
            // Let this producer park on the queue before the next one starts.
            tokio::task::yield_now().await;
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(receiver.recv().await.unwrap().name.to_string());
        }
        assert_eq!(order, vec!["a", "b", "c", "d"]);

        for producer in producers {
            assert_eq!(producer.await.unwrap(), Ok(()));
        }
    }

    #[tokio::test]
    async fn test_push_fails_when_worker_gone() {
        let (queue, receiver) = run_queue();
        drop(receiver);
        assert_eq!(queue.push(image("a")).await, Err(QueueClosed));
    }
}
