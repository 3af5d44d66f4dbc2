use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(String),

    #[error("invalid object path {0:?}")]
    InvalidPath(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("object store backend error: {0}")]
    Backend(String),
}

impl ObjectStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A flat namespace of byte blobs addressed by `/`-separated paths.
///
/// `put` must be atomic from a reader's point of view: `get` returns either
/// the previous content or the complete new content.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), ObjectStoreError>;

    async fn get(&self, path: &str) -> Result<Bytes, ObjectStoreError>;

    /// Every path starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    /// Removes `path`. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, ObjectStoreError> {
        let paths = self.list(prefix).await?;
        for path in &paths {
            self.delete(path).await?;
        }
        Ok(paths.len())
    }
}

pub(crate) fn validate_path(path: &str) -> Result<(), ObjectStoreError> {
    let valid = !path.is_empty()
        && !path.starts_with('/')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(ObjectStoreError::InvalidPath(path.to_owned()))
    }
}

/// Process-local store, used for tests and single-host runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        validate_path(path)?;
        self.objects.lock().unwrap().insert(path.to_owned(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(path.to_owned()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .range(prefix.to_owned()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }
}

const TEMP_MARKER: &str = ".partial-";

/// Store backed by a directory tree. Writes go to a temporary sibling file
/// that is renamed into place once complete.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }
}

fn io_error(path: &str, source: io::Error) -> ObjectStoreError {
    if source.kind() == io::ErrorKind::NotFound {
        ObjectStoreError::NotFound(path.to_owned())
    } else {
        ObjectStoreError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        let mut temp_name = target.as_os_str().to_owned();
        temp_name.push(format!("{TEMP_MARKER}{:016x}", rand::random::<u64>()));
        let temp = PathBuf::from(temp_name);
        tokio::fs::write(&temp, &data)
            .await
            .map_err(|e| io_error(path, e))?;
        if let Err(err) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(io_error(path, err));
        }
        trace!(path, bytes = data.len(), "Wrote object");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, ObjectStoreError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(path, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Ok(vec![]);
            }
            let mut paths = Vec::new();
            for entry in walkdir::WalkDir::new(&root) {
                let entry = entry.map_err(|e| ObjectStoreError::Io {
                    path: root.display().to_string(),
                    source: e.into(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(TEMP_MARKER) || !key.starts_with(&prefix) {
                    continue;
                }
                paths.push(key);
            }
            paths.sort();
            Ok(paths)
        })
        .await
        .map_err(|e| ObjectStoreError::Backend(format!("listing task failed: {e}")))?
    }

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(path, err)),
        }
        // prune directories left empty, stopping at the root
        let mut dir = target.parent();
        while let Some(current) = dir {
            if current == self.root || tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}
