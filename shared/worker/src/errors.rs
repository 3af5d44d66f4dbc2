use kestrel_cache::CacheError;
use kestrel_checkpoint::CheckpointError;
use kestrel_core::Checksum;
use kestrel_sharding::{PlanError, ShardId};
use std::{io, path::PathBuf};
use thiserror::Error;

use crate::{CollectiveError, process::WorkerEnvError};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker environment: {0}")]
    Env(#[from] WorkerEnvError),

    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("base model unavailable: {0}")]
    Cache(#[from] CacheError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(
        "checkpoint at step {step} was written with plan {found}, current plan is {expected}"
    )]
    PlanMismatch {
        step: u64,
        expected: Checksum,
        found: Checksum,
    },

    #[error("checkpoint shard {expected} decoded as {found}")]
    WrongShard { expected: ShardId, found: ShardId },

    #[error("malformed shard state: {0}")]
    ShardState(#[from] postcard::Error),

    #[error("final checkpoint at step {step} was not committed after {attempts} attempts")]
    FinalCommit { step: u64, attempts: u32 },

    #[error("synchronization failed: {0}")]
    Collective(#[from] CollectiveError),

    #[error("trainer failed: {0:#}")]
    Trainer(anyhow::Error),

    #[error("data source failed: {0:#}")]
    Data(anyhow::Error),

    #[error("couldn't remove stale lock file {path}: {source}")]
    Lockfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkerError {
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint(CheckpointError::ChecksumMismatch { .. })
        )
    }

    pub fn is_stall(&self) -> bool {
        matches!(self, Self::Collective(CollectiveError::Timeout { .. }))
    }
}
