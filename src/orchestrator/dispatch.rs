//! Run dispatch: build if needed, then hand the image to its host's queue.

use std::sync::Arc;
use tracing::info;

use crate::error::{OpResult, OrchestratorError};

use super::build::build_locked;
use super::connection::Connection;
use super::image::Image;

/// Conflict check, implicit build and enqueue form one critical section on
/// the image, so two concurrent runs cannot both get through.
pub(crate) async fn dispatch(image: Arc<Image>, connection: Arc<Connection>) -> OpResult<()> {
    let mut state = image.write().await;

    if state.removed {
        return Err(OrchestratorError::image_not_found(image.name.as_str()));
    }
    if state.queued {
        return Err(OrchestratorError::Conflict(format!(
            "A container for image {} is already queued.",
            image.name
        )));
    }
    if state.is_running() {
        return Err(OrchestratorError::Conflict(format!(
            "A container for image {} is already running. Please stop the existing container before starting a new one.",
            image.name
        )));
    }

    if !state.is_built_on(&connection) {
        build_locked(&image, &mut state, &connection).await?;
    }

    // The worker clears the flag once it holds the lock.
    state.queued = true;
    if let Err(e) = connection.enqueue(image.clone()).await {
        state.queued = false;
        return Err(e);
    }

    info!("Queued image {} on `{}`", image.name, connection.name);
    Ok(())
}
