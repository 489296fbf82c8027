//! Podman-backed [`RuntimeClient`] speaking the Docker-compatible API via bollard.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::ContainerStateStatusEnum;
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Datelike, Utc};
use futures_util::StreamExt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::types::{BuildId, ContainerId, HostName};
use crate::workspace::OUTPUT_DIR;

use super::tunnel::SshTunnel;
use super::{
    Connector, ContainerReport, OutputChunk, OutputStream, RemoteState, RuntimeClient,
    RuntimeError, RuntimeResult,
};

pub struct PodmanClient {
    host: HostName,
    docker: Docker,
    tunnel: Option<SshTunnel>,
}

impl PodmanClient {
    pub async fn connect(
        host: &HostName,
        server: &ServerConfig,
        timeout_secs: u64,
    ) -> RuntimeResult<Self> {
        let tunnel = if server.host.is_some() {
            Some(SshTunnel::open(host, server).await?)
        } else {
            None
        };

        let socket = match &tunnel {
            Some(t) => t.local_socket().to_string_lossy().into_owned(),
            None => server.podman_socket.clone(),
        };

        let docker = match Docker::connect_with_socket(&socket, timeout_secs, API_DEFAULT_VERSION)
        {
            Ok(docker) => docker,
            Err(e) => {
                if let Some(t) = &tunnel {
                    t.close().await;
                }
                return Err(RuntimeError::Connect(e.to_string()));
            }
        };

        let client = Self {
            host: host.clone(),
            docker,
            tunnel,
        };

        if let Err(e) = client.docker.ping().await {
            client.close().await;
            return Err(RuntimeError::Connect(format!(
                "ping of {} failed: {}",
                server.address(),
                e
            )));
        }

        info!("Connected to server `{}` at {}", host, server.address());
        Ok(client)
    }
}

#[async_trait]
impl RuntimeClient for PodmanClient {
    async fn build_image(&self, name: &str, context_dir: &Path) -> RuntimeResult<BuildId> {
        let dockerfile = if context_dir.join("Containerfile").is_file() {
            "Containerfile"
        } else {
            "Dockerfile"
        };

        let dir = context_dir.to_path_buf();
        let tarball = tokio::task::spawn_blocking(move || archive_context(&dir))
            .await
            .map_err(|e| RuntimeError::operation("build_image", e.to_string()))??;

        let tag = format!("maestro/{name}:latest");
        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(tarball.into()));
        let mut image_id = None;
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| map_error("build_image", e))?;
            if let Some(error) = info.error {
                return Err(RuntimeError::operation("build_image", error));
            }
            if let Some(line) = info.stream.as_deref() {
                debug!("[{}] build {}: {}", self.host, name, line.trim_end());
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
        }

        if let Some(id) = image_id {
            return Ok(BuildId::new(id));
        }

        // Podman does not always report the id in the build stream.
        let inspect = self
            .docker
            .inspect_image(&tag)
            .await
            .map_err(|e| map_error("inspect_image", e))?;
        inspect
            .id
            .map(BuildId::new)
            .ok_or_else(|| RuntimeError::operation("build_image", "no image id reported"))
    }

    async fn remove_image(&self, id: &BuildId) -> RuntimeResult<()> {
        self.docker
            .remove_image(
                id.as_str(),
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
            .map_err(|e| map_error("remove_image", e))?;
        Ok(())
    }

    async fn create_container(&self, image: &BuildId, name: &str) -> RuntimeResult<ContainerId> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(image.to_string()),
            tty: Some(false),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_error("create_container", e))?;
        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start_container", e))
    }

    async fn stop_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        match self
            .docker
            .stop_container(id.as_str(), Some(StopContainerOptions { t: 0 }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: gone.
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(map_error("stop_container", e)),
        }
    }

    async fn remove_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    v: true,
                    force: false,
                    link: false,
                }),
            )
            .await
            .map_err(|e| map_error("remove_container", e))
    }

    async fn inspect_container(&self, id: &ContainerId) -> RuntimeResult<ContainerReport> {
        let response = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect_container", e))?;

        let state = response.state.unwrap_or_default();
        let remote = match state.status {
            Some(ContainerStateStatusEnum::RUNNING) => RemoteState::Running,
            Some(ContainerStateStatusEnum::EXITED) => RemoteState::Exited,
            Some(other) => RemoteState::Other(format!("{other:?}").to_lowercase()),
            None => RemoteState::Other("unknown".to_string()),
        };

        Ok(ContainerReport {
            state: remote,
            started_at: state.started_at.as_deref().and_then(parse_timestamp),
            finished_at: state.finished_at.as_deref().and_then(parse_timestamp),
        })
    }

    async fn attach_container(&self, id: &ContainerId) -> RuntimeResult<OutputStream> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            ..Default::default()
        };

        let AttachContainerResults { output, .. } = self
            .docker
            .attach_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_error("attach_container", e))?;

        let stream = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message)))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(map_error("attach_container", e))),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

/// Opens a [`PodmanClient`] per configured server.
pub struct PodmanConnector {
    request_timeout_secs: u64,
}

impl PodmanConnector {
    pub fn new(request_timeout_secs: u64) -> Self {
        Self {
            request_timeout_secs,
        }
    }
}

#[async_trait]
impl Connector for PodmanConnector {
    async fn connect(
        &self,
        host: &HostName,
        server: &ServerConfig,
    ) -> RuntimeResult<Arc<dyn RuntimeClient>> {
        let client = PodmanClient::connect(host, server, self.request_timeout_secs).await?;
        Ok(Arc::new(client))
    }
}

fn map_error(operation: &'static str, error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::operation(operation, other.to_string()),
    }
}

/// Podman reports "0001-01-01T00:00:00Z" for timestamps that were never set.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.year() > 1)
}

/// Tar the build context, leaving out the directory that holds run output.
fn archive_context(dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, dir, Path::new(""))?;
    builder.into_inner()
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, dir: &Path, prefix: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if prefix.as_os_str().is_empty() && name.to_str() == Some(OUTPUT_DIR) {
            continue;
        }

        let path = entry.path();
        let rel = prefix.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            builder.append_dir(&rel, &path)?;
            append_dir(builder, &path, &rel)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(&path, &rel)?;
        }
    }
    Ok(())
}
