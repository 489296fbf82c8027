// Capture of a container's stdout/stderr into files under its image directory.

use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::runtime::{OutputChunk, OutputStream, RuntimeError, RuntimeResult};
use crate::workspace;

/// How long a closed capture may keep draining before it is aborted.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct OutputSinks {
    stdout: File,
    stderr: File,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

impl OutputSinks {
    /// Create the output files of `container_name`. The image directory
    /// itself must already exist; only the output subdirectory is created.
    pub async fn open(image_dir: &Path, container_name: &str) -> std::io::Result<Self> {
        if !tokio::fs::metadata(image_dir).await?.is_dir() {
            return Err(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("{} is not a directory", image_dir.display()),
            ));
        }

        let (stdout_path, stderr_path) = workspace::output_paths(image_dir, container_name);
        if let Some(parent) = stdout_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        Ok(Self {
            stdout: File::create(&stdout_path).await?,
            stderr: File::create(&stderr_path).await?,
            stdout_path,
            stderr_path,
        })
    }

    async fn write(&mut self, chunk: OutputChunk) -> std::io::Result<()> {
        match chunk {
            OutputChunk::Stdout(bytes) => self.stdout.write_all(&bytes).await,
            OutputChunk::Stderr(bytes) => self.stderr.write_all(&bytes).await,
        }
    }

    async fn flush(&mut self) {
        for (file, path) in [
            (&mut self.stdout, &self.stdout_path),
            (&mut self.stderr, &self.stderr_path),
        ] {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush {}: {}", path.display(), e);
            }
        }
    }
}

/// Background copy of an attached output stream into its sinks.
///
/// The copy ends with the stream. A stream that ended in an error is
/// reported by [`OutputCapture::finish`].
pub struct OutputCapture {
    handle: JoinHandle<RuntimeResult<()>>,
}

impl OutputCapture {
    pub fn spawn(label: String, stream: OutputStream, sinks: OutputSinks) -> Self {
        Self {
            handle: tokio::spawn(copy_output(label, stream, sinks)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the copy to end and return how the stream ended.
    pub async fn finish(self) -> RuntimeResult<()> {
        self.handle
            .await
            .map_err(|e| RuntimeError::operation("attach_container", e.to_string()))?
    }

    pub fn close(self) {
        if self.handle.is_finished() {
            return;
        }
        let mut handle = self.handle;
        tokio::spawn(async move {
            if tokio::time::timeout(DRAIN_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        });
    }
}

/// Local write failures only end the copy; stream failures are returned.
async fn copy_output(
    label: String,
    mut stream: OutputStream,
    mut sinks: OutputSinks,
) -> RuntimeResult<()> {
    let mut outcome = Ok(());
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if let Err(e) = sinks.write(chunk).await {
                    warn!("Failed to write output of {}: {}", label, e);
                    break;
                }
            }
            Err(e) => {
                warn!("Output stream of {} failed: {}", label, e);
                outcome = Err(e);
                break;
            }
        }
    }

    sinks.flush().await;
    debug!("Output capture for {} finished", label);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_capture_splits_streams() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = OutputSinks::open(dir.path(), "c1").await.unwrap();
        let stdout_path = sinks.stdout_path.clone();
        let stderr_path = sinks.stderr_path.clone();

        let chunks = vec![
            Ok(OutputChunk::Stdout(Bytes::from_static(b"hello "))),
            Ok(OutputChunk::Stderr(Bytes::from_static(b"oops\n"))),
            Ok(OutputChunk::Stdout(Bytes::from_static(b"world\n"))),
        ];
        let stream: OutputStream = Box::pin(futures_util::stream::iter(chunks));

        let capture = OutputCapture::spawn("test".to_string(), stream, sinks);
        capture.finish().await.unwrap();

        assert_eq!(std::fs::read_to_string(stdout_path).unwrap(), "hello world\n");
        assert_eq!(std::fs::read_to_string(stderr_path).unwrap(), "oops\n");
    }

    #[tokio::test]
    async fn test_capture_stops_on_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let sinks = OutputSinks::open(dir.path(), "c2").await.unwrap();
        let stdout_path = sinks.stdout_path.clone();

        let chunks = vec![
            Ok(OutputChunk::Stdout(Bytes::from_static(b"before"))),
            Err(RuntimeError::operation("attach_container", "connection reset")),
            Ok(OutputChunk::Stdout(Bytes::from_static(b"after"))),
        ];
        let stream: OutputStream = Box::pin(futures_util::stream::iter(chunks));

        let capture = OutputCapture::spawn("test".to_string(), stream, sinks);
        let err = capture.finish().await.unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert_eq!(std::fs::read_to_string(stdout_path).unwrap(), "before");
    }

    #[tokio::test]
    async fn test_open_requires_existing_image_dir() {
        let root = tempfile::tempdir().unwrap();
        let gone = root.path().join("deleted");

        assert!(OutputSinks::open(&gone, "c3").await.is_err());
        assert!(!gone.exists());

        std::fs::write(root.path().join("file"), "x").unwrap();
        assert!(OutputSinks::open(&root.path().join("file"), "c3").await.is_err());
    }
}
