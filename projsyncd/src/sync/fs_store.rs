use std::io;
use std::path::{Path, PathBuf};

use projsync_core::{FileEntry, ProjectMetadata};
use tracing::{debug, warn};

use super::paths::{PathError, local_path_for, normalize_path};
use super::store::{DurableStore, StoreError};

pub const METADATA_FILE: &str = ".project.json";
/// File names with this prefix are reserved for in-progress writes.
const TEMP_PREFIX: &str = ".projsync-tmp-";

/// Directory-per-project store: `<root>/<project>/.project.json` holds the
/// metadata, every other file under `<root>/<project>/` is project content.
#[derive(Debug, Clone)]
pub struct FsProjectStore {
    root: PathBuf,
}

impl FsProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create_project(&self, metadata: &ProjectMetadata) -> Result<(), StoreError> {
        let dir = self.project_dir(&metadata.id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let body = serde_json::to_vec_pretty(metadata)?;
        write_atomically(&dir.join(METADATA_FILE), &body).await?;
        debug!(project = %metadata.id, "created project directory");
        Ok(())
    }

    fn project_dir(&self, project_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !project_id.is_empty()
            && project_id != "."
            && project_id != ".."
            && !project_id.contains(['/', '\\']);
        if !valid {
            return Err(PathError::UnsupportedComponent.into());
        }
        Ok(self.root.join(project_id))
    }

    async fn existing_project_dir(&self, project_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.project_dir(project_id)?;
        match tokio::fs::metadata(dir.join(METADATA_FILE)).await {
            Ok(_) => Ok(dir),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::ProjectNotFound(project_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_entry(&self, dir: &Path, entry: &FileEntry) -> Result<(), StoreError> {
        let path = normalize_path(&entry.path)?;
        if path == format!("/{METADATA_FILE}") || is_reserved_name(&path) {
            return Err(PathError::UnsupportedComponent.into());
        }
        let target = local_path_for(dir, &path)?;
        let content = entry.decode()?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomically(&target, &content).await?;
        Ok(())
    }
}

impl DurableStore for FsProjectStore {
    async fn project(&self, project_id: &str) -> Result<ProjectMetadata, StoreError> {
        let dir = self.existing_project_dir(project_id).await?;
        let body = tokio::fs::read(dir.join(METADATA_FILE)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn list_paths(&self, project_id: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.existing_project_dir(project_id).await?;
        let mut paths = Vec::new();
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let local = entry.path();
                if file_type.is_dir() {
                    pending.push(local);
                    continue;
                }
                if current == dir && entry.file_name() == METADATA_FILE {
                    continue;
                }
                if is_temp_file(&local) {
                    continue;
                }
                let relative = local.strip_prefix(&dir).unwrap_or(&local);
                match normalize_path(&relative.to_string_lossy()) {
                    Ok(path) => paths.push(path),
                    Err(err) => warn!(path = %local.display(), error = %err, "skipping unmappable file"),
                }
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn read_file(&self, project_id: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        let dir = self.existing_project_dir(project_id).await?;
        let target = local_path_for(&dir, &normalize_path(path)?)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::FileNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_file(&self, project_id: &str, entry: &FileEntry) -> Result<(), StoreError> {
        let dir = self.existing_project_dir(project_id).await?;
        self.write_entry(&dir, entry).await
    }

    async fn delete_file(&self, project_id: &str, path: &str) -> Result<(), StoreError> {
        let dir = self.existing_project_dir(project_id).await?;
        let target = local_path_for(&dir, &normalize_path(path)?)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::FileNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn batch_write(&self, project_id: &str, entries: &[FileEntry]) -> Result<(), StoreError> {
        let dir = self.existing_project_dir(project_id).await?;
        let mut first_error = None;
        for entry in entries {
            if let Err(err) = self.write_entry(&dir, entry).await {
                warn!(project = project_id, path = %entry.path, error = %err, "batch entry failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn write_atomically(target: &Path, content: &[u8]) -> io::Result<()> {
    let partial = partial_path(target);
    tokio::fs::write(&partial, content).await?;
    tokio::fs::rename(partial, target).await
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{TEMP_PREFIX}{name}"))
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(TEMP_PREFIX))
}

fn is_reserved_name(project_path: &str) -> bool {
    project_path
        .rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}
