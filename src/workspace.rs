//! On-disk source directories, one per image, under the configured root.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{OpResult, OrchestratorError};
use crate::types::ImageName;

/// Per-image directory holding run output; never part of a build context.
pub const OUTPUT_DIR: &str = ".maestro";
const LOGS_DIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open the images root. An unreadable root is a configuration failure.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root).map_err(|e| {
            anyhow::anyhow!("Cannot read images directory {}: {}", root.display(), e)
        })?;
        if !meta.is_dir() {
            return Err(anyhow::anyhow!(
                "Images path {} is not a directory",
                root.display()
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_dir(&self, name: &ImageName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Image names for every (non-hidden) subdirectory of the root.
    pub async fn scan(&self) -> std::io::Result<Vec<ImageName>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!("Skipping non UTF-8 directory {:?}", entry.file_name());
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(ImageName::new(name));
        }
        names.sort();
        Ok(names)
    }

    /// Provision a fresh, empty source directory for `name`.
    pub async fn create(&self, name: &str) -> OpResult<PathBuf> {
        validate_image_name(name)?;
        let dir = self.root.join(name);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {
                info!("Created source directory {}", dir.display());
                Ok(dir)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(OrchestratorError::Conflict(
                format!("Image {name} already exists"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Recursively delete a source directory.
    pub async fn remove(&self, dir: &Path) -> OpResult<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn validate_image_name(name: &str) -> OpResult<()> {
    validate_component(name)?;
    if name.starts_with('.') {
        return Err(OrchestratorError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Reject anything that is not exactly one normal path component.
pub fn validate_component(name: &str) -> OpResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name == OUTPUT_DIR
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(OrchestratorError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Names of the regular files directly inside `dir`, sorted.
pub async fn list_files(dir: &Path) -> OpResult<Vec<String>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }
        files.push(entry.file_name().to_string_lossy().into_owned());
    }
    files.sort();
    Ok(files)
}

pub async fn write_file(dir: &Path, file_name: &str, contents: &[u8]) -> OpResult<PathBuf> {
    validate_component(file_name)?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

/// Path of an existing file in `dir`.
pub async fn existing_file(dir: &Path, file_name: &str) -> OpResult<PathBuf> {
    validate_component(file_name)?;
    let path = dir.join(file_name);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        Ok(_) => Err(OrchestratorError::file_not_found(file_name)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(OrchestratorError::file_not_found(file_name))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_file(dir: &Path, file_name: &str) -> OpResult<()> {
    validate_component(file_name)?;
    match tokio::fs::remove_file(dir.join(file_name)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(OrchestratorError::file_not_found(file_name))
        }
        Err(e) => Err(e.into()),
    }
}

/// Where the stdout/stderr of container `container_name` are captured.
pub fn output_paths(dir: &Path, container_name: &str) -> (PathBuf, PathBuf) {
    let logs = dir.join(OUTPUT_DIR).join(LOGS_DIR);
    (
        logs.join(format!("{container_name}.stdout")),
        logs.join(format!("{container_name}.stderr")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_skips_files_and_hidden_dirs() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("beta")).unwrap();
        std::fs::create_dir(root.path().join("alpha")).unwrap();
        std::fs::create_dir(root.path().join(".cache")).unwrap();
        std::fs::write(root.path().join("notes.txt"), "x").unwrap();

        let ws = Workspace::open(root.path()).unwrap();
        let names = ws.scan().await.unwrap();
        assert_eq!(names, vec![ImageName::new("alpha"), ImageName::new("beta")]);
    }

    #[test]
    fn test_open_rejects_missing_root() {
        let root = tempfile::tempdir().unwrap();
        assert!(Workspace::open(root.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_create_conflict_and_invalid() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::open(root.path()).unwrap();

        let dir = ws.create("demo").await.unwrap();
        assert!(dir.is_dir());

        assert!(ws.create("demo").await.unwrap_err().is_conflict());
        for bad in ["", "..", "a/b", ".hidden", OUTPUT_DIR] {
            assert!(matches!(
                ws.create(bad).await,
                Err(OrchestratorError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_file_operations() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::open(root.path()).unwrap();
        let dir = ws.create("demo").await.unwrap();
        std::fs::create_dir(dir.join("sub")).unwrap();

        write_file(&dir, "main.py", b"print('hi')").await.unwrap();
        write_file(&dir, "Containerfile", b"FROM python").await.unwrap();
        assert_eq!(
            list_files(&dir).await.unwrap(),
            vec!["Containerfile".to_string(), "main.py".to_string()]
        );

        let path = existing_file(&dir, "main.py").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"print('hi')");
        assert!(existing_file(&dir, "nope").await.unwrap_err().is_not_found());
        assert!(existing_file(&dir, "sub").await.unwrap_err().is_not_found());
        assert!(matches!(
            write_file(&dir, "../escape", b"x").await,
            Err(OrchestratorError::InvalidName(_))
        ));

        delete_file(&dir, "main.py").await.unwrap();
        assert!(delete_file(&dir, "main.py").await.unwrap_err().is_not_found());
        assert_eq!(list_files(&dir).await.unwrap(), vec!["Containerfile".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_deletes_recursively() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::open(root.path()).unwrap();
        let dir = ws.create("demo").await.unwrap();
        std::fs::create_dir_all(dir.join("a").join("b")).unwrap();
        std::fs::write(dir.join("a").join("b").join("f"), "x").unwrap();

        ws.remove(&dir).await.unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_output_paths_live_under_output_dir() {
        let (out, err) = output_paths(Path::new("/srv/images/demo"), "container-1");
        assert_eq!(
            out,
            PathBuf::from("/srv/images/demo/.maestro/logs/container-1.stdout")
        );
        assert_eq!(
            err,
            PathBuf::from("/srv/images/demo/.maestro/logs/container-1.stderr")
        );
    }
}
