use chrono::{DateTime, Utc};
use kestrel_core::{Checksum, JobId};
use kestrel_sharding::ShardId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitState {
    InProgress,
    Committed,
    Corrupt,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in-progress"),
            Self::Committed => write!(f, "committed"),
            Self::Corrupt => write!(f, "corrupt"),
        }
    }
}

/// Acknowledgement that a shard was uploaded and read back intact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAck {
    pub shard: ShardId,
    pub checksum: Checksum,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Metadata for one checkpoint step, stored next to its shards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job_id: JobId,
    pub step: u64,
    pub state: CommitState,
    /// Fingerprint of the partition plan the shards were cut with.
    pub plan_fingerprint: Checksum,
    pub world_size: u32,
    /// Every shard a committed checkpoint must contain.
    pub manifest: Vec<ShardId>,
    /// Verified shards, filled in on finalize.
    #[serde(default)]
    pub shards: Vec<ShardAck>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    pub fn is_committed(&self) -> bool {
        self.state == CommitState::Committed
    }

    pub fn expects(&self, shard: &ShardId) -> bool {
        self.manifest.binary_search(shard).is_ok()
    }

    pub fn ack(&self, shard: &ShardId) -> Option<&ShardAck> {
        self.shards.iter().find(|ack| ack.shard == *shard)
    }

    pub fn total_bytes(&self) -> u64 {
        self.shards.iter().map(|ack| ack.size).sum()
    }
}

/// Canonical checkpoint a resubmitted job resumes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub job_id: JobId,
    pub step: u64,
    pub plan_fingerprint: Checksum,
    pub recorded_at: DateTime<Utc>,
}

pub(crate) mod layout {
    use kestrel_core::JobId;
    use kestrel_sharding::ShardId;

    const STEP_DIR: &str = "step-";
    pub const RECORD_FILE: &str = "record.json";

    pub fn job_prefix(job_id: &JobId) -> String {
        format!("{job_id}/")
    }

    pub fn step_prefix(job_id: &JobId, step: u64) -> String {
        format!("{job_id}/{STEP_DIR}{step:012}/")
    }

    pub fn record(job_id: &JobId, step: u64) -> String {
        format!("{}{RECORD_FILE}", step_prefix(job_id, step))
    }

    pub fn shards_prefix(job_id: &JobId, step: u64) -> String {
        format!("{}shards/", step_prefix(job_id, step))
    }

    pub fn shard(job_id: &JobId, step: u64, shard: &ShardId) -> String {
        format!("{}{}.bin", shards_prefix(job_id, step), shard.key())
    }

    pub fn ack(job_id: &JobId, step: u64, shard: &ShardId) -> String {
        format!("{}acks/{}.json", step_prefix(job_id, step), shard.key())
    }

    pub fn resume(job_id: &JobId) -> String {
        format!("{job_id}/resume.json")
    }

    /// Step number of a `{job}/step-NNN/record.json` path.
    pub fn record_step(job_id: &JobId, path: &str) -> Option<u64> {
        path.strip_prefix(&job_prefix(job_id))?
            .strip_prefix(STEP_DIR)?
            .strip_suffix(RECORD_FILE)?
            .strip_suffix('/')?
            .parse()
            .ok()
    }
}
