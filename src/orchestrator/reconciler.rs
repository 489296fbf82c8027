//! Periodic reconciliation of local container status with the runtime.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::runtime::RemoteState;
use crate::types::ImageName;

use super::image::{ContainerStatus, Image};
use super::output::OutputCapture;

pub type ImageRegistry = Registry<ImageName, Arc<Image>>;

pub(crate) async fn run_reconciler(
    images: Arc<ImageRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Status reconciler started ({:?} interval)", interval);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let finished = reconcile_once(&images).await;
                if finished > 0 {
                    debug!("Reconciler marked {} container(s) finished", finished);
                }
            }
        }
    }

    info!("Status reconciler stopped");
}

/// One sweep over every registered image. Returns how many containers were
/// moved to `finished`. A running container whose output stream failed is
/// moved to `error` instead.
pub(crate) async fn reconcile_once(images: &ImageRegistry) -> usize {
    let mut snapshot = Vec::with_capacity(images.len());
    images.range(|_, image| {
        snapshot.push(image.clone());
        true
    });

    let mut finished = 0;
    for image in snapshot {
        if reconcile_image(&image).await {
            finished += 1;
        }
    }
    finished
}

async fn reconcile_image(image: &Image) -> bool {
    let mut state = image.write().await;
    let Some(container) = state.container.as_mut() else {
        return false;
    };
    if container.status != ContainerStatus::Running {
        return false;
    }
    let Some(id) = container.id.clone() else {
        return false;
    };

    // A lost output stream means the run can no longer be followed.
    if container.capture.as_ref().is_some_and(OutputCapture::is_finished) {
        if let Some(capture) = container.capture.take() {
            if let Err(e) = capture.finish().await {
                warn!("Output of container {} was lost: {}", container.name, e);
                container.status = ContainerStatus::Error;
                return false;
            }
        }
    }

    let report = match container.connection.client().inspect_container(&id).await {
        Ok(report) => report,
        Err(e) => {
            warn!("Error inspecting container {}: {}", id, e);
            return false;
        }
    };

    if report.state != RemoteState::Exited {
        return false;
    }

    container.finished_at = Some(report.finished_at.unwrap_or_else(Utc::now));
    container.status = ContainerStatus::Finished;
    container.close_capture();
    info!("Container {} of image {} finished", container.name, image.name);
    true
}
