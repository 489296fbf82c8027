// SSH forwarding of a remote Podman socket to a local unix socket.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::types::HostName;

use super::{RuntimeError, RuntimeResult};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READY_TIMEOUT: Duration = Duration::from_secs(15);

/// A running `ssh -N -L` process. The child is killed when the tunnel is
/// closed or dropped.
pub struct SshTunnel {
    host: HostName,
    local_socket: PathBuf,
    child: Mutex<Option<Child>>,
}

impl SshTunnel {
    pub async fn open(host: &HostName, server: &ServerConfig) -> RuntimeResult<Self> {
        let destination = server.ssh_destination().ok_or_else(|| {
            RuntimeError::Connect(format!("server `{host}` has no ssh host configured"))
        })?;

        let local_socket = std::env::temp_dir().join(format!(
            "maestro-{}-{}.sock",
            host,
            uuid::Uuid::new_v4().simple()
        ));

        let mut cmd = Command::new("ssh");
        cmd.arg("-N")
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "StreamLocalBindUnlink=yes"]);
        if let Some(identity) = server.identity_file.as_deref() {
            cmd.arg("-i").arg(identity);
        }
        if let Some(port) = server.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg("-L")
            .arg(format!("{}:{}", local_socket.display(), server.podman_socket))
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        info!("Opening ssh tunnel to `{destination}` for server `{host}`");
        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Connect(format!("failed to spawn ssh: {e}")))?;

        wait_for_socket(&mut child, &local_socket).await?;
        debug!("Tunnel for `{host}` ready at {}", local_socket.display());

        Ok(Self {
            host: host.clone(),
            local_socket,
            child: Mutex::new(Some(child)),
        })
    }

    pub fn local_socket(&self) -> &Path {
        &self.local_socket
    }

    pub async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop ssh tunnel for `{}`: {}", self.host, e);
            }
        }
        let _ = tokio::fs::remove_file(&self.local_socket).await;
    }
}

async fn wait_for_socket(child: &mut Child, socket: &Path) -> RuntimeResult<()> {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;

    loop {
        if tokio::fs::try_exists(socket).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            return Err(RuntimeError::Connect(format!("ssh exited early with {status}")));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RuntimeError::Connect(format!(
                "forwarded socket {} did not appear",
                socket.display()
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
