use chrono::{DateTime, Utc};
use kestrel_core::{RetryPolicy, retry_with_backoff};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::{ArtifactRef, CacheError, Credentials, HubError, ModelHub};

pub const ENTRY_MARKER: &str = ".kestrel-entry.json";
const STAGING_DIR: &str = ".staging";

/// Cache root: `explicit` if given, else `$KESTREL_CACHE_DIR`, else
/// `$HOME/.cache/kestrel`.
pub fn resolve_cache_root(explicit: Option<&Path>) -> Result<PathBuf, CacheError> {
    cache_root_from(
        explicit,
        std::env::var("KESTREL_CACHE_DIR").ok(),
        std::env::var("HOME").ok(),
    )
    .ok_or(CacheError::NoCacheDir)
}

fn cache_root_from(
    explicit: Option<&Path>,
    env_dir: Option<String>,
    home: Option<String>,
) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_owned());
    }
    if let Some(dir) = env_dir.filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    home.filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".cache").join("kestrel"))
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Upper bound on the summed size of all entries.
    pub max_bytes: Option<u64>,
    /// Entries fetched longer ago than this are refetched.
    pub max_age: Option<Duration>,
    pub retry: RetryPolicy,
    pub credentials: Credentials,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: None,
            max_age: None,
            retry: RetryPolicy::default(),
            credentials: Credentials::default(),
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Contents of an entry's marker file. An entry directory without a marker
/// is an interrupted fetch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact: ArtifactRef,
    pub key: String,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    Artifact(ArtifactRef),
    /// Entries older than the configured `max_age`, plus interrupted fetches.
    Stale,
    /// Evict least recently used entries until at most this many bytes remain.
    ToBudget(u64),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Cache keys of the removed entries.
    pub removed: Vec<String>,
    pub freed_bytes: u64,
}

impl PurgeReport {
    fn absorb(&mut self, other: PurgeReport) {
        self.removed.extend(other.removed);
        self.freed_bytes += other.freed_bytes;
    }
}

type KeyLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive use of one cache key. On drop, the key's lock leaves the map
/// unless another task holds or awaits it.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        forget_idle_lock(self.locks, &self.key);
    }
}

// callers only clone a lock while holding the map, so a count of one
// cannot race with a new user
fn forget_idle_lock(locks: &KeyLocks, key: &str) {
    let mut locks = locks.lock().unwrap();
    if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        locks.remove(key);
    }
}

/// Local copies of remote model artifacts, fetched at most once per entry.
pub struct CacheManager {
    config: CacheConfig,
    hub: Arc<dyn ModelHub>,
    locks: KeyLocks,
}

impl CacheManager {
    pub fn new(config: CacheConfig, hub: Arc<dyn ModelHub>) -> Self {
        Self {
            config,
            hub,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Manager with the same settings and hub over another directory.
    pub fn relocated(&self, root: impl Into<PathBuf>) -> Self {
        let config = CacheConfig {
            root: root.into(),
            ..self.config.clone()
        };
        Self::new(config, self.hub.clone())
    }

    pub fn entry_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.config.root.join(artifact.cache_key())
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .clone()
    }

    async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let guard = self.key_lock(key).lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    /// `None` while another task holds `key`.
    fn try_lock_key(&self, key: &str) -> Option<KeyGuard<'_>> {
        match self.key_lock(key).try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                locks: &self.locks,
                key: key.to_owned(),
                guard: Some(guard),
            }),
            Err(_) => {
                forget_idle_lock(&self.locks, key);
                None
            }
        }
    }

    fn is_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let Some(max_age) = self.config.max_age else {
            return false;
        };
        let age = now.signed_duration_since(entry.fetched_at);
        age.to_std().map_or(false, |age| age >= max_age)
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.config.root.join(key).join(ENTRY_MARKER);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entry) => Ok(Some(entry)),
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "Ignoring malformed cache marker");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::io(path)(err)),
        }
    }

    async fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.config.root.join(&entry.key).join(ENTRY_MARKER);
        let bytes = serde_json::to_vec_pretty(entry).map_err(|source| CacheError::Marker {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(CacheError::io(path))
    }

    /// Path of a complete local copy of `artifact`, fetching it first if
    /// there is no fresh entry.
    pub async fn ensure_local(&self, artifact: &ArtifactRef) -> Result<PathBuf, CacheError> {
        let key = artifact.cache_key();
        let _guard = self.lock_key(&key).await;
        let entry_dir = self.config.root.join(&key);

        if let Some(mut entry) = self.read_entry(&key).await? {
            let now = Utc::now();
            if !self.is_stale(&entry, now) {
                entry.last_used = now;
                self.write_entry(&entry).await?;
                debug!(artifact = %artifact, path = %entry_dir.display(), "Cache hit");
                return Ok(entry_dir);
            }
            info!(artifact = %artifact, fetched_at = %entry.fetched_at, "Cache entry is stale, refetching");
        }
        remove_dir_if_exists(&entry_dir).await?;

        let (staging, size) = match self.fetch_to_staging(artifact, &key).await {
            Ok(fetched) => fetched,
            Err(err) if err.is_storage_full() => {
                warn!(artifact = %artifact, "Disk full while fetching, purging least recently used entries");
                let report = self.evict_lru(0, Some(&key)).await?;
                info!(removed = report.removed.len(), freed_bytes = report.freed_bytes, "Purged cache");
                self.fetch_to_staging(artifact, &key)
                    .await
                    .map_err(|err| fetch_failed(artifact, err))?
            }
            Err(err) => return Err(fetch_failed(artifact, err)),
        };

        if let Some(max_bytes) = self.config.max_bytes {
            if let Err(err) = self.make_room(artifact, &key, size, max_bytes).await {
                remove_dir_if_exists(&staging).await?;
                return Err(err);
            }
        }

        tokio::fs::rename(&staging, &entry_dir)
            .await
            .map_err(CacheError::io(&entry_dir))?;
        let now = Utc::now();
        let entry = CacheEntry {
            artifact: artifact.clone(),
            key,
            size_bytes: size,
            fetched_at: now,
            last_used: now,
        };
        self.write_entry(&entry).await?;
        info!(artifact = %artifact, path = %entry_dir.display(), bytes = size, "Cached artifact");
        Ok(entry_dir)
    }

    /// Downloads into a fresh staging directory, retrying network failures.
    async fn fetch_to_staging(
        &self,
        artifact: &ArtifactRef,
        key: &str,
    ) -> Result<(PathBuf, u64), HubError> {
        let staging_root = self.config.root.join(STAGING_DIR);
        retry_with_backoff(
            self.config.retry,
            "artifact fetch",
            HubError::is_retryable,
            || {
                let staging = staging_root.join(format!("{key}-{:08x}", rand::random::<u32>()));
                async move {
                    tokio::fs::create_dir_all(&staging).await?;
                    let fetched = self
                        .hub
                        .fetch(artifact, &staging, &self.config.credentials)
                        .await;
                    match fetched {
                        Ok(size) => Ok((staging, size)),
                        Err(err) => {
                            let _ = tokio::fs::remove_dir_all(&staging).await;
                            Err(err)
                        }
                    }
                }
            },
        )
        .await
    }

    async fn make_room(
        &self,
        artifact: &ArtifactRef,
        key: &str,
        size: u64,
        max_bytes: u64,
    ) -> Result<(), CacheError> {
        if size > max_bytes {
            return Err(CacheError::DiskExhausted {
                artifact: artifact.to_string(),
                reason: format!("artifact is {size} bytes, cache budget is {max_bytes}"),
            });
        }
        let report = self.evict_lru(max_bytes - size, Some(key)).await?;
        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), freed_bytes = report.freed_bytes, "Evicted entries to fit cache budget");
        }
        let used: u64 = self
            .entries()
            .await?
            .iter()
            .filter(|e| e.key != key)
            .map(|e| e.size_bytes)
            .sum();
        if used + size > max_bytes {
            return Err(CacheError::DiskExhausted {
                artifact: artifact.to_string(),
                reason: format!(
                    "{used} bytes in use by other entries, {size} more exceeds the budget of {max_bytes}"
                ),
            });
        }
        Ok(())
    }

    /// Complete entries currently in the cache.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        for key in self.entry_dirs().await? {
            if let Some(entry) = self.read_entry(&key).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub async fn total_bytes(&self) -> Result<u64, CacheError> {
        Ok(self.entries().await?.iter().map(|e| e.size_bytes).sum())
    }

    async fn entry_dirs(&self) -> Result<Vec<String>, CacheError> {
        let root = &self.config.root;
        let mut dirs = match tokio::fs::read_dir(root).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(CacheError::io(root)(err)),
        };
        let mut keys = Vec::new();
        while let Some(dir) = dirs.next_entry().await.map_err(CacheError::io(root))? {
            let name = dir.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && dir.path().is_dir() {
                keys.push(name);
            }
        }
        Ok(keys)
    }

    /// Removes `key` unless another task holds it. Returns the bytes freed.
    async fn remove_unlocked(&self, key: &str, size: u64) -> Result<Option<u64>, CacheError> {
        let Some(_guard) = self.try_lock_key(key) else {
            debug!(key, "Skipping cache entry in use");
            return Ok(None);
        };
        let dir = self.config.root.join(key);
        // marker first, so a half-removed directory never looks complete
        match tokio::fs::remove_file(dir.join(ENTRY_MARKER)).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::io(dir)(err)),
        }
        remove_dir_if_exists(&dir).await?;
        Ok(Some(size))
    }

    async fn evict_lru(&self, target: u64, keep: Option<&str>) -> Result<PurgeReport, CacheError> {
        let mut entries = self.entries().await?;
        entries.sort_by_key(|e| e.last_used);
        let mut total: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let mut report = PurgeReport::default();
        for entry in entries {
            if total <= target {
                break;
            }
            if keep == Some(entry.key.as_str()) {
                continue;
            }
            if let Some(freed) = self.remove_unlocked(&entry.key, entry.size_bytes).await? {
                total -= freed;
                report.removed.push(entry.key);
                report.freed_bytes += freed;
            }
        }
        Ok(report)
    }

    /// Interrupted fetches and leftover staging directories.
    async fn purge_incomplete(&self) -> Result<PurgeReport, CacheError> {
        let mut report = PurgeReport::default();
        for key in self.entry_dirs().await? {
            if self.read_entry(&key).await?.is_none() && self.remove_unlocked(&key, 0).await?.is_some() {
                report.removed.push(key);
            }
        }
        let staging_root = self.config.root.join(STAGING_DIR);
        if let Ok(mut staged) = tokio::fs::read_dir(&staging_root).await {
            while let Some(dir) = staged.next_entry().await.map_err(CacheError::io(&staging_root))? {
                let name = dir.file_name().to_string_lossy().into_owned();
                let key = name.rsplit_once('-').map_or(name.as_str(), |(key, _)| key);
                if let Some(_guard) = self.try_lock_key(key) {
                    remove_dir_if_exists(&dir.path()).await?;
                }
            }
        }
        Ok(report)
    }

    pub async fn purge(&self, scope: PurgeScope) -> Result<PurgeReport, CacheError> {
        let mut report = PurgeReport::default();
        match &scope {
            PurgeScope::All => {
                for entry in self.entries().await? {
                    if let Some(freed) = self.remove_unlocked(&entry.key, entry.size_bytes).await? {
                        report.removed.push(entry.key);
                        report.freed_bytes += freed;
                    }
                }
                report.absorb(self.purge_incomplete().await?);
            }
            PurgeScope::Artifact(artifact) => {
                let key = artifact.cache_key();
                if let Some(entry) = self.read_entry(&key).await? {
                    if let Some(freed) = self.remove_unlocked(&key, entry.size_bytes).await? {
                        report.removed.push(key);
                        report.freed_bytes += freed;
                    }
                } else if self.config.root.join(&key).is_dir()
                    && self.remove_unlocked(&key, 0).await?.is_some()
                {
                    report.removed.push(key);
                }
            }
            PurgeScope::Stale => {
                let now = Utc::now();
                for entry in self.entries().await? {
                    if !self.is_stale(&entry, now) {
                        continue;
                    }
                    if let Some(freed) = self.remove_unlocked(&entry.key, entry.size_bytes).await? {
                        report.removed.push(entry.key);
                        report.freed_bytes += freed;
                    }
                }
                report.absorb(self.purge_incomplete().await?);
            }
            PurgeScope::ToBudget(bytes) => report = self.evict_lru(*bytes, None).await?,
        }
        info!(
            ?scope,
            removed = report.removed.len(),
            freed_bytes = report.freed_bytes,
            "Purged cache"
        );
        Ok(report)
    }
}

fn fetch_failed(artifact: &ArtifactRef, err: HubError) -> CacheError {
    if err.is_storage_full() {
        CacheError::DiskExhausted {
            artifact: artifact.to_string(),
            reason: err.to_string(),
        }
    } else {
        CacheError::FetchUnavailable {
            artifact: artifact.to_string(),
            source: err,
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::io(path)(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_root_precedence() {
        let explicit = Path::new("/data/cache");
        assert_eq!(
            cache_root_from(Some(explicit), Some("/env".into()), Some("/home/u".into())),
            Some(PathBuf::from("/data/cache"))
        );
        assert_eq!(
            cache_root_from(None, Some("/env".into()), Some("/home/u".into())),
            Some(PathBuf::from("/env"))
        );
        assert_eq!(
            cache_root_from(None, Some(String::new()), Some("/home/u".into())),
            Some(PathBuf::from("/home/u/.cache/kestrel"))
        );
        assert_eq!(cache_root_from(None, None, None), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_key_locks_are_released() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("config.json"), b"{}").unwrap();
        let artifact = ArtifactRef::local(source);
        let cache = Arc::new(CacheManager::new(
            CacheConfig::new(dir.path().join("cache")),
            Arc::new(crate::LocalDirHub),
        ));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let artifact = artifact.clone();
                tokio::spawn(async move { cache.ensure_local(&artifact).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(cache.locks.lock().unwrap().is_empty());

        // a key held elsewhere stays registered until its holder is done
        let key = artifact.cache_key();
        let held = cache.lock_key(&key).await;
        assert!(cache.try_lock_key(&key).is_none());
        assert_eq!(cache.locks.lock().unwrap().len(), 1);
        drop(held);
        assert!(cache.locks.lock().unwrap().is_empty());

        cache.purge(PurgeScope::All).await.unwrap();
        assert!(cache.locks.lock().unwrap().is_empty());
    }
}
