use std::{io, path::PathBuf};
use thiserror::Error;

use crate::HubError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("artifact {artifact} is unavailable: {source}")]
    FetchUnavailable {
        artifact: String,
        #[source]
        source: HubError,
    },

    #[error("not enough local disk for {artifact}: {reason}")]
    DiskExhausted { artifact: String, reason: String },

    #[error("no cache directory configured and $HOME is unset")]
    NoCacheDir,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed cache marker {path}: {source}")]
    Marker {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
