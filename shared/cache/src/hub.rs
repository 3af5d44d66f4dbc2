use async_trait::async_trait;
use futures::future::try_join_all;
use hf_hub::{Repo, RepoType, api::tokio::ApiError};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::ArtifactRef;

pub const MODEL_EXTENSIONS: [&str; 4] = [".safetensors", ".json", ".model", ".txt"];

pub(crate) fn is_model_file(filename: &str, extensions: &[&str]) -> bool {
    extensions.is_empty() || extensions.iter().any(|ext| filename.ends_with(ext))
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("no hub configured for {0}")]
    Unsupported(String),
}

impl HubError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_storage_full(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::StorageFull)
    }
}

/// Secrets handed to a hub for one fetch.
#[derive(Clone, Default)]
pub struct Credentials {
    pub hub_token: Option<String>,
}

impl Credentials {
    /// Reads `HF_TOKEN`.
    pub fn from_env() -> Self {
        Self {
            hub_token: std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("hub_token", &self.hub_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A remote source of model artifacts.
#[async_trait]
pub trait ModelHub: Send + Sync {
    /// Downloads `artifact` into the existing, empty directory `dest` and
    /// returns the number of bytes written.
    async fn fetch(
        &self,
        artifact: &ArtifactRef,
        dest: &Path,
        credentials: &Credentials,
    ) -> Result<u64, HubError>;
}

/// Hugging Face Hub repositories.
#[derive(Debug, Clone)]
pub struct HfHub {
    pub max_concurrent_downloads: usize,
    pub extensions: Vec<&'static str>,
    pub progress_bar: bool,
}

impl Default for HfHub {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            extensions: MODEL_EXTENSIONS.to_vec(),
            progress_bar: false,
        }
    }
}

fn classify(repo: &str, err: ApiError) -> HubError {
    match err {
        ApiError::RequestError(err) => match err.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => HubError::Auth(format!("{repo}: {err}")),
            Some(404) => HubError::NotFound(repo.to_owned()),
            _ => HubError::Network(format!("{repo}: {err}")),
        },
        ApiError::IoError(err) => HubError::Io(err),
        other => HubError::Network(format!("{repo}: {other}")),
    }
}

#[async_trait]
impl ModelHub for HfHub {
    async fn fetch(
        &self,
        artifact: &ArtifactRef,
        dest: &Path,
        credentials: &Credentials,
    ) -> Result<u64, HubError> {
        let ArtifactRef::Hub { repo, revision } = artifact else {
            return Err(HubError::Unsupported(artifact.to_string()));
        };
        let hf_repo = match revision {
            Some(revision) => Repo::with_revision(repo.clone(), RepoType::Model, revision.clone()),
            None => Repo::model(repo.clone()),
        };
        // hf-hub's own blob cache lives inside the staging directory and is
        // dropped once the files are copied out
        let hub_cache = dest.join(".hf-hub");
        let api = hf_hub::api::tokio::ApiBuilder::new()
            .with_cache_dir(hub_cache.clone())
            .with_token(credentials.hub_token.clone())
            .with_progress(self.progress_bar)
            .build()
            .map_err(|e| classify(repo, e))?
            .repo(hf_repo);

        let siblings = api
            .info()
            .await
            .map_err(|e| classify(repo, e))?
            .siblings
            .into_iter()
            .filter(|s| is_model_file(&s.rfilename, &self.extensions))
            .collect::<Vec<_>>();
        if siblings.is_empty() {
            return Err(HubError::NotFound(format!("{repo} has no model files")));
        }

        let mut downloaded: Vec<(String, PathBuf)> = Vec::with_capacity(siblings.len());
        for chunk in siblings.chunks(self.max_concurrent_downloads.max(1)) {
            let futures = chunk.iter().map(|sibling| {
                let api = &api;
                async move {
                    let start = Instant::now();
                    debug!(filename = sibling.rfilename, "Starting file download from hub");
                    let path = api.get(&sibling.rfilename).await?;
                    info!(
                        filename = sibling.rfilename,
                        duration_secs = start.elapsed().as_secs_f32(),
                        "Finished downloading file from hub"
                    );
                    Ok::<_, ApiError>((sibling.rfilename.clone(), path))
                }
            });
            downloaded.extend(
                try_join_all(futures)
                    .await
                    .map_err(|e| classify(repo, e))?,
            );
        }

        let mut total = 0;
        for (name, blob) in downloaded {
            let target = dest.join(&name);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            total += tokio::fs::copy(&blob, &target).await?;
        }
        tokio::fs::remove_dir_all(&hub_cache).await?;
        Ok(total)
    }
}

/// Copies artifacts that already live on a local or network filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalDirHub;

fn copy_tree(source: &Path, dest: &Path) -> Result<u64, HubError> {
    if !source.exists() {
        return Err(HubError::NotFound(source.display().to_string()));
    }
    if source.is_file() {
        let name = source
            .file_name()
            .ok_or_else(|| HubError::NotFound(source.display().to_string()))?;
        return Ok(std::fs::copy(source, dest.join(name))?);
    }
    let mut total = 0;
    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            total += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(total)
}

#[async_trait]
impl ModelHub for LocalDirHub {
    async fn fetch(
        &self,
        artifact: &ArtifactRef,
        dest: &Path,
        _credentials: &Credentials,
    ) -> Result<u64, HubError> {
        let ArtifactRef::Local(source) = artifact else {
            return Err(HubError::Unsupported(artifact.to_string()));
        };
        let source = source.clone();
        let dest = dest.to_owned();
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest))
            .await
            .map_err(|e| HubError::Io(io::Error::other(e)))?
    }
}

/// Dispatches each artifact to the hub for its scheme.
#[derive(Clone)]
pub struct HubRouter {
    hf: Arc<dyn ModelHub>,
    gcs: Option<Arc<dyn ModelHub>>,
    local: Arc<dyn ModelHub>,
}

impl Default for HubRouter {
    fn default() -> Self {
        Self {
            hf: Arc::new(HfHub::default()),
            #[cfg(feature = "gcs")]
            gcs: Some(Arc::new(crate::GcsHub::default())),
            #[cfg(not(feature = "gcs"))]
            gcs: None,
            local: Arc::new(LocalDirHub),
        }
    }
}

impl HubRouter {
    pub fn with_hf(mut self, hub: Arc<dyn ModelHub>) -> Self {
        self.hf = hub;
        self
    }

    pub fn with_gcs(mut self, hub: Arc<dyn ModelHub>) -> Self {
        self.gcs = Some(hub);
        self
    }
}

#[async_trait]
impl ModelHub for HubRouter {
    async fn fetch(
        &self,
        artifact: &ArtifactRef,
        dest: &Path,
        credentials: &Credentials,
    ) -> Result<u64, HubError> {
        let hub = match artifact {
            ArtifactRef::Hub { .. } => &self.hf,
            ArtifactRef::Local(_) => &self.local,
            ArtifactRef::Gcs { .. } => self
                .gcs
                .as_ref()
                .ok_or_else(|| HubError::Unsupported(artifact.to_string()))?,
        };
        hub.fetch(artifact, dest, credentials).await
    }
}
