//! Build coordination: replace whatever an image had built with a fresh
//! build on the requested host.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{OpResult, OrchestratorError};
use crate::types::BuildId;

use super::connection::Connection;
use super::image::{BuildRef, Image, ImageState};

/// Rebuild `image` on `connection`. The caller holds the image's write lock.
///
/// The old container and old build are removed first, best-effort, from the
/// host they live on. If the new build then fails, the previous build
/// reference is kept even though its remote artifact may already be gone.
pub(crate) async fn build_locked(
    image: &Image,
    state: &mut ImageState,
    connection: &Arc<Connection>,
) -> OpResult<BuildId> {
    if let Some(container) = &state.container {
        if let Some(id) = &container.id {
            match container.connection.client().remove_container(id).await {
                Ok(()) => debug!("Removed container {} of image {}", id, image.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(
                    "Failed to remove container {} of image {} on `{}`: {}",
                    id, image.name, container.connection.name, e
                ),
            }
        }
    }

    if let Some(build) = &state.build {
        match build.connection.client().remove_image(&build.id).await {
            Ok(()) => debug!("Removed build {} of image {}", build.id, image.name),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                "Failed to remove build {} of image {} on `{}`: {}",
                build.id, image.name, build.connection.name, e
            ),
        }
    }

    info!("Building image {} on `{}`", image.name, connection.name);
    let id = connection
        .client()
        .build_image(image.name.as_str(), &image.files_dir)
        .await
        .map_err(|source| OrchestratorError::Build {
            image: image.name.to_string(),
            host: connection.name.to_string(),
            source,
        })?;

    info!("Built image {} on `{}` as {}", image.name, connection.name, id);
    state.build = Some(BuildRef {
        id: id.clone(),
        connection: connection.clone(),
    });
    Ok(id)
}
