use bytes::Bytes;
use chrono::{DateTime, Utc};
use kestrel_core::{Checksum, JobId};
use kestrel_sharding::{PartitionPlan, ShardId};
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    CheckpointError, CheckpointRecord, CommitState, ObjectStore, ObjectStoreError, ResumePoint,
    ShardAck, record::layout,
};

pub const DEFAULT_KEEP_COMMITTED: usize = 5;
pub const DEFAULT_ABANDON_AFTER: Duration = Duration::from_secs(60 * 60);

/// Step-addressed checkpoints on top of an [`ObjectStore`].
///
/// A step is only ever visible to readers once [`CheckpointStore::finalize`]
/// has confirmed that every shard in its manifest was uploaded and verified.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    keep_committed: usize,
    abandon_after: Duration,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            keep_committed: DEFAULT_KEEP_COMMITTED,
            abandon_after: DEFAULT_ABANDON_AFTER,
        }
    }

    /// Number of newest committed checkpoints `gc` never deletes. At least one
    /// is always kept.
    pub fn with_keep_committed(mut self, keep: usize) -> Self {
        self.keep_committed = keep.max(1);
        self
    }

    /// Age after which an `in-progress` record is considered abandoned.
    pub fn with_abandon_after(mut self, abandon_after: Duration) -> Self {
        self.abandon_after = abandon_after;
        self
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, CheckpointError> {
        match self.store.get(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| CheckpointError::Metadata {
                    path: path.to_owned(),
                    source,
                }),
            Err(ObjectStoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| CheckpointError::Metadata {
            path: path.to_owned(),
            source,
        })?;
        self.store.put(path, Bytes::from(bytes)).await?;
        Ok(())
    }

    pub async fn record(
        &self,
        job_id: &JobId,
        step: u64,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        self.read_json(&layout::record(job_id, step)).await
    }

    async fn existing_record(
        &self,
        job_id: &JobId,
        step: u64,
    ) -> Result<CheckpointRecord, CheckpointError> {
        self.record(job_id, step)
            .await?
            .ok_or_else(|| CheckpointError::NotFound {
                job_id: job_id.clone(),
                step,
            })
    }

    /// Starts a commit for `step`. Leftovers of an earlier attempt at the same
    /// step that never committed are discarded.
    pub async fn begin_commit(
        &self,
        job_id: &JobId,
        step: u64,
        plan: &PartitionPlan,
    ) -> Result<CheckpointRecord, CheckpointError> {
        if let Some(existing) = self.record(job_id, step).await? {
            if existing.is_committed() {
                return Err(CheckpointError::AlreadyCommitted {
                    job_id: job_id.clone(),
                    step,
                });
            }
            let removed = self
                .store
                .delete_prefix(&layout::step_prefix(job_id, step))
                .await?;
            debug!(job_id = %job_id, step, state = %existing.state, removed, "Discarded earlier commit attempt");
        }

        let record = CheckpointRecord {
            job_id: job_id.clone(),
            step,
            state: CommitState::InProgress,
            plan_fingerprint: plan.fingerprint(),
            world_size: plan.world_size(),
            manifest: plan.checkpoint_manifest().into_iter().collect(),
            shards: vec![],
            created_at: Utc::now(),
            committed_at: None,
        };
        self.write_json(&layout::record(job_id, step), &record)
            .await?;
        info!(job_id = %job_id, step, shards = record.manifest.len(), "Began checkpoint commit");
        Ok(record)
    }

    /// Attaches to a commit another rank began.
    pub async fn open_commit(
        &self,
        job_id: &JobId,
        step: u64,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let record = self.existing_record(job_id, step).await?;
        match record.state {
            CommitState::Corrupt => Err(CheckpointError::Corrupt { step }),
            _ => Ok(record),
        }
    }

    /// Uploads one shard of `record`, reads it back and writes its ack.
    /// Uploading content identical to an existing verified ack does nothing.
    pub async fn upload_shard(
        &self,
        record: &CheckpointRecord,
        shard: &ShardId,
        data: Bytes,
    ) -> Result<ShardAck, CheckpointError> {
        let (job_id, step) = (&record.job_id, record.step);
        if !record.expects(shard) {
            return Err(CheckpointError::UnexpectedShard {
                step,
                shard: shard.clone(),
            });
        }

        let checksum = Checksum::of(&data);
        let ack_path = layout::ack(job_id, step, shard);
        let shard_path = layout::shard(job_id, step, shard);

        if let Some(existing) = self.read_json::<ShardAck>(&ack_path).await? {
            if existing.checksum == checksum && self.object_matches(&shard_path, &checksum).await? {
                debug!(job_id = %job_id, step, shard = %shard, "Shard already uploaded");
                return Ok(existing);
            }
            let current = self.existing_record(job_id, step).await?;
            if current.is_committed() {
                return Err(CheckpointError::AlreadyCommitted {
                    job_id: job_id.clone(),
                    step,
                });
            }
        }

        let size = data.len() as u64;
        self.store.put(&shard_path, data).await?;
        let written = self.store.get(&shard_path).await?;
        let actual = Checksum::of(&written);
        if actual != checksum {
            return Err(CheckpointError::ChecksumMismatch {
                shard: shard.clone(),
                expected: checksum,
                actual,
            });
        }

        let ack = ShardAck {
            shard: shard.clone(),
            checksum,
            size,
            uploaded_at: Utc::now(),
        };
        self.write_json(&ack_path, &ack).await?;
        debug!(job_id = %job_id, step, shard = %shard, size, "Uploaded shard");
        Ok(ack)
    }

    async fn object_matches(&self, path: &str, checksum: &Checksum) -> Result<bool, CheckpointError> {
        match self.store.get(path).await {
            Ok(bytes) => Ok(checksum.matches(&bytes)),
            Err(ObjectStoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Promotes `record` to committed once every manifest shard has a
    /// verified ack and its object is present. Otherwise the record stays
    /// in progress and [`CheckpointError::IncompleteCheckpoint`] lists what
    /// is missing.
    pub async fn finalize(
        &self,
        record: &CheckpointRecord,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let (job_id, step) = (&record.job_id, record.step);
        let mut current = self.existing_record(job_id, step).await?;
        match current.state {
            CommitState::Committed => return Ok(current),
            CommitState::Corrupt => return Err(CheckpointError::Corrupt { step }),
            CommitState::InProgress => {}
        }

        let present: BTreeSet<String> = self
            .store
            .list(&layout::shards_prefix(job_id, step))
            .await?
            .into_iter()
            .collect();

        let mut acks = Vec::with_capacity(current.manifest.len());
        let mut missing = Vec::new();
        for shard in &current.manifest {
            let ack = self
                .read_json::<ShardAck>(&layout::ack(job_id, step, shard))
                .await?;
            match ack {
                Some(ack) if present.contains(&layout::shard(job_id, step, shard)) => {
                    acks.push(ack)
                }
                _ => missing.push(shard.clone()),
            }
        }
        if !missing.is_empty() {
            warn!(
                job_id = %job_id,
                step,
                missing = missing.len(),
                expected = current.manifest.len(),
                "Checkpoint incomplete, not committing"
            );
            return Err(CheckpointError::IncompleteCheckpoint { step, missing });
        }

        current.state = CommitState::Committed;
        current.shards = acks;
        current.committed_at = Some(Utc::now());
        self.write_json(&layout::record(job_id, step), &current)
            .await?;
        info!(
            job_id = %job_id,
            step,
            shards = current.shards.len(),
            bytes = current.total_bytes(),
            "Committed checkpoint"
        );
        Ok(current)
    }

    /// Every record of `job_id` that can be read, in ascending step order.
    pub async fn records(&self, job_id: &JobId) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let mut steps: Vec<u64> = self
            .store
            .list(&layout::job_prefix(job_id))
            .await?
            .iter()
            .filter_map(|path| layout::record_step(job_id, path))
            .collect();
        steps.sort_unstable();

        let mut records = Vec::with_capacity(steps.len());
        for step in steps {
            match self.record(job_id, step).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(CheckpointError::Metadata { path, source }) => {
                    warn!(path, error = %source, "Skipping unreadable checkpoint record");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    /// Highest committed step. In-progress and corrupt records are ignored.
    pub async fn latest_committed(
        &self,
        job_id: &JobId,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self
            .records(job_id)
            .await?
            .into_iter()
            .rev()
            .find(CheckpointRecord::is_committed))
    }

    /// Reads a shard of a committed checkpoint and verifies its checksum.
    pub async fn load_shard(
        &self,
        record: &CheckpointRecord,
        shard: &ShardId,
    ) -> Result<Bytes, CheckpointError> {
        if !record.is_committed() {
            return Err(CheckpointError::NotCommitted { step: record.step });
        }
        let ack = record
            .ack(shard)
            .ok_or_else(|| CheckpointError::UnexpectedShard {
                step: record.step,
                shard: shard.clone(),
            })?;
        let data = self
            .store
            .get(&layout::shard(&record.job_id, record.step, shard))
            .await?;
        let actual = Checksum::of(&data);
        if actual != ack.checksum {
            warn!(job_id = %record.job_id, step = record.step, shard = %shard, "Shard checksum mismatch");
            return Err(CheckpointError::ChecksumMismatch {
                shard: shard.clone(),
                expected: ack.checksum,
                actual,
            });
        }
        Ok(data)
    }

    /// Excludes `record` from future resumes.
    pub async fn mark_corrupt(
        &self,
        record: &CheckpointRecord,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let mut current = self.existing_record(&record.job_id, record.step).await?;
        current.state = CommitState::Corrupt;
        self.write_json(&layout::record(&record.job_id, record.step), &current)
            .await?;
        warn!(job_id = %record.job_id, step = record.step, "Marked checkpoint corrupt");
        Ok(current)
    }

    async fn remove_step(&self, job_id: &JobId, step: u64) -> Result<(), CheckpointError> {
        // record first, so a partially deleted step is never mistaken for a
        // committed one
        self.store.delete(&layout::record(job_id, step)).await?;
        self.store
            .delete_prefix(&layout::step_prefix(job_id, step))
            .await?;
        Ok(())
    }

    /// Deletes committed and corrupt checkpoints below `older_than_step`,
    /// always keeping the newest `keep_committed` committed ones. Returns the
    /// removed steps.
    pub async fn gc(&self, job_id: &JobId, older_than_step: u64) -> Result<Vec<u64>, CheckpointError> {
        let records = self.records(job_id).await?;
        let protected: BTreeSet<u64> = records
            .iter()
            .rev()
            .filter(|r| r.is_committed())
            .take(self.keep_committed)
            .map(|r| r.step)
            .collect();

        let mut removed = Vec::new();
        for record in records {
            if record.step >= older_than_step
                || record.state == CommitState::InProgress
                || protected.contains(&record.step)
            {
                continue;
            }
            self.remove_step(job_id, record.step).await?;
            removed.push(record.step);
        }
        if !removed.is_empty() {
            info!(job_id = %job_id, ?removed, "Removed superseded checkpoints");
        }
        Ok(removed)
    }

    /// Deletes in-progress records older than the abandon threshold as of
    /// `now`. Returns the removed steps.
    pub async fn sweep_abandoned(
        &self,
        job_id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<u64>, CheckpointError> {
        let abandon_after = chrono::Duration::from_std(self.abandon_after)
            .unwrap_or(chrono::Duration::MAX);
        let mut removed = Vec::new();
        for record in self.records(job_id).await? {
            if record.state != CommitState::InProgress {
                continue;
            }
            let abandoned = now
                .signed_duration_since(record.created_at)
                .ge(&abandon_after);
            if abandoned {
                self.remove_step(job_id, record.step).await?;
                removed.push(record.step);
            }
        }
        if !removed.is_empty() {
            info!(job_id = %job_id, ?removed, "Swept abandoned checkpoint commits");
        }
        Ok(removed)
    }

    pub async fn record_resume_point(
        &self,
        job_id: &JobId,
        record: &CheckpointRecord,
    ) -> Result<ResumePoint, CheckpointError> {
        if !record.is_committed() {
            return Err(CheckpointError::NotCommitted { step: record.step });
        }
        let point = ResumePoint {
            job_id: job_id.clone(),
            step: record.step,
            plan_fingerprint: record.plan_fingerprint,
            recorded_at: Utc::now(),
        };
        self.write_json(&layout::resume(job_id), &point).await?;
        info!(job_id = %job_id, step = record.step, "Recorded resume point");
        Ok(point)
    }

    pub async fn resume_point(&self, job_id: &JobId) -> Result<Option<ResumePoint>, CheckpointError> {
        self.read_json(&layout::resume(job_id)).await
    }

    /// Checkpoint a restarted job should load: always the highest committed
    /// step. A recorded resume point pointing anywhere else is stale.
    pub async fn resolve_resume(
        &self,
        job_id: &JobId,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let latest = self.latest_committed(job_id).await?;
        if let Some(point) = self.resume_point(job_id).await? {
            let latest_step = latest.as_ref().map(|record| record.step);
            if latest_step != Some(point.step) {
                warn!(
                    job_id = %job_id,
                    recorded = point.step,
                    latest = ?latest_step,
                    "Ignoring stale resume point"
                );
            }
        }
        Ok(latest)
    }
}
