//! Local cache of remote model artifacts.
//!
//! [`CacheManager::ensure_local`] turns an [`ArtifactRef`] into a directory
//! on local disk, downloading through a [`ModelHub`] only when no fresh copy
//! exists. Under disk pressure, least recently used entries are purged.

mod artifact;
mod errors;
#[cfg(feature = "gcs")]
mod gcs;
mod hub;
mod manager;

pub use artifact::{ArtifactRef, ParseArtifactError};
pub use errors::CacheError;
#[cfg(feature = "gcs")]
pub use gcs::GcsHub;
pub use hub::{Credentials, HfHub, HubError, HubRouter, LocalDirHub, MODEL_EXTENSIONS, ModelHub};
pub use manager::{
    CacheConfig, CacheEntry, CacheManager, ENTRY_MARKER, PurgeReport, PurgeScope,
    resolve_cache_root,
};
