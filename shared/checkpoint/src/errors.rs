use kestrel_core::{Checksum, JobId};
use kestrel_sharding::ShardId;
use thiserror::Error;

use crate::ObjectStoreError;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint {job_id} step {step} is already committed")]
    AlreadyCommitted { job_id: JobId, step: u64 },

    #[error("no checkpoint record for {job_id} step {step}")]
    NotFound { job_id: JobId, step: u64 },

    #[error("checkpoint step {step} is not committed")]
    NotCommitted { step: u64 },

    #[error("checkpoint step {step} is marked corrupt")]
    Corrupt { step: u64 },

    #[error("shard {shard} is not part of the manifest for step {step}")]
    UnexpectedShard { step: u64, shard: ShardId },

    #[error("checkpoint at step {step} is incomplete, missing {} shard(s): {}", missing.len(), shard_list(missing))]
    IncompleteCheckpoint { step: u64, missing: Vec<ShardId> },

    #[error("checksum mismatch for shard {shard}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        shard: ShardId,
        expected: Checksum,
        actual: Checksum,
    },

    #[error("malformed metadata at {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("object store error: {0}")]
    Store(#[from] ObjectStoreError),
}

fn shard_list(shards: &[ShardId]) -> String {
    const SHOWN: usize = 4;
    let mut names: Vec<String> = shards.iter().take(SHOWN).map(|s| s.to_string()).collect();
    if shards.len() > SHOWN {
        names.push(format!("and {} more", shards.len() - SHOWN));
    }
    names.join(", ")
}
