use crate::domains::export::types::ExportResult;
use crate::domains::export::writer::RenderedFile;
use crate::errors::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Destination for rendered exports
#[async_trait]
pub trait StorageTarget: Send + Sync {
    /// Store `file` at `destination` on `disk`, returning the final location.
    ///
    /// The rendered file is consumed: it no longer exists once this succeeds.
    async fn store(&self, file: &RenderedFile, destination: &str, disk: &str) -> ExportResult<PathBuf>;

    /// Whether `disk` names a configured disk
    fn has_disk(&self, disk: &str) -> bool;
}

/// Named local directories ("disks")
pub struct LocalDiskStorage {
    disks: HashMap<String, PathBuf>,
}

impl LocalDiskStorage {
    /// Creates storage with a single disk. The directory is created if needed.
    pub fn new(disk: &str, base_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let mut storage = Self {
            disks: HashMap::new(),
        };
        storage.add_disk(disk, base_path)?;
        Ok(storage)
    }

    pub fn add_disk(&mut self, disk: &str, base_path: impl Into<PathBuf>) -> std::io::Result<()> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        self.disks.insert(disk.to_string(), base_path);
        Ok(())
    }

    fn base_path(&self, disk: &str) -> StorageResult<&Path> {
        self.disks
            .get(disk)
            .map(PathBuf::as_path)
            .ok_or_else(|| StorageError::UnknownDisk(disk.to_string()))
    }

    /// Resolve `destination` under `disk`, refusing anything that could leave
    /// the disk's base directory.
    pub fn resolve(&self, destination: &str, disk: &str) -> StorageResult<PathBuf> {
        let base = self.base_path(disk)?;
        let relative = Path::new(destination);

        let mut resolved = base.to_path_buf();
        let mut components = 0;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| StorageError::InvalidPathComponent(destination.to_string()))?;
                    resolved.push(Self::sanitize_component(part)?);
                    components += 1;
                }
                Component::CurDir => {}
                _ => {
                    return Err(StorageError::InvalidPathComponent(destination.to_string()));
                }
            }
        }

        if components == 0 {
            return Err(StorageError::InvalidPathComponent(destination.to_string()));
        }
        if !resolved.starts_with(base) {
            return Err(StorageError::PermissionDenied(
                "Attempt to write outside disk base path".to_string(),
            ));
        }
        Ok(resolved)
    }

    fn sanitize_component(component: &str) -> StorageResult<String> {
        if component.is_empty() || component.contains('\\') || component == "." || component == ".." {
            Err(StorageError::InvalidPathComponent(component.to_string()))
        } else {
            Ok(component.to_string())
        }
    }

    async fn move_into_place(source: &Path, target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut partial = target.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        // A stale partial from an earlier attempt is simply overwritten
        fs::copy(source, &partial).await?;
        if let Err(e) = fs::rename(&partial, target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        fs::remove_file(source).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageTarget for LocalDiskStorage {
    async fn store(&self, file: &RenderedFile, destination: &str, disk: &str) -> ExportResult<PathBuf> {
        let target = self.resolve(destination, disk)?;
        if fs::metadata(&file.path).await.is_err() {
            return Err(StorageError::ArtifactMissing(file.path.display().to_string()).into());
        }

        Self::move_into_place(&file.path, &target).await?;
        log::info!(
            "Stored {} rows at {} (disk '{}')",
            file.rows_written,
            target.display(),
            disk
        );
        Ok(target)
    }

    fn has_disk(&self, disk: &str) -> bool {
        self.disks.contains_key(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::types::{ExportError, WriterFormat};
    use tempfile::TempDir;

    fn rendered(dir: &Path, contents: &str) -> RenderedFile {
        let path = dir.join("artifact.rendered.csv");
        std::fs::write(&path, contents).unwrap();
        RenderedFile {
            path,
            format: WriterFormat::csv(),
            rows_written: 1,
        }
    }

    #[tokio::test]
    async fn test_store_moves_file_into_disk() {
        let staging = TempDir::new().unwrap();
        let disk = TempDir::new().unwrap();
        let storage = LocalDiskStorage::new("local", disk.path()).unwrap();
        let file = rendered(staging.path(), "a,b\n");

        let stored = storage.store(&file, "reports/2024/q1.csv", "local").await.unwrap();
        assert_eq!(stored, disk.path().join("reports/2024/q1.csv"));
        assert_eq!(std::fs::read_to_string(&stored).unwrap(), "a,b\n");
        assert!(!file.path.exists());
        assert!(!disk.path().join("reports/2024/q1.csv.partial").exists());
    }

    #[tokio::test]
    async fn test_store_overwrites_existing_destination() {
        let staging = TempDir::new().unwrap();
        let disk = TempDir::new().unwrap();
        let storage = LocalDiskStorage::new("local", disk.path()).unwrap();
        std::fs::write(disk.path().join("out.csv"), "old").unwrap();

        let file = rendered(staging.path(), "new");
        storage.store(&file, "out.csv", "local").await.unwrap();
        assert_eq!(std::fs::read_to_string(disk.path().join("out.csv")).unwrap(), "new");
    }

    #[test]
    fn test_resolve_rejects_escaping_paths() {
        let disk = TempDir::new().unwrap();
        let storage = LocalDiskStorage::new("local", disk.path()).unwrap();

        assert!(storage.resolve("../etc/passwd", "local").is_err());
        assert!(storage.resolve("/abs/out.csv", "local").is_err());
        assert!(storage.resolve("", "local").is_err());
        assert!(storage.resolve("a/./b.csv", "local").is_ok());
        assert!(matches!(
            storage.resolve("out.csv", "s3"),
            Err(StorageError::UnknownDisk(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_reported() {
        let disk = TempDir::new().unwrap();
        let storage = LocalDiskStorage::new("local", disk.path()).unwrap();
        let file = RenderedFile {
            path: disk.path().join("gone.csv"),
            format: WriterFormat::csv(),
            rows_written: 0,
        };
        let err = storage.store(&file, "out.csv", "local").await.unwrap_err();
        assert!(matches!(err, ExportError::Storage(msg) if msg.contains("missing")));
    }
}
