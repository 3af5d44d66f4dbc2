use bytes::Bytes;
use kestrel_cache::{ArtifactRef, CacheManager};
use kestrel_checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore};
use kestrel_core::{
    ExitReason, HealthStatus, JobId, Rank, RetryPolicy, RunningAverage, Topology, WorkerEvent,
    WorkerHeartbeat, WorkerOutcome, retry_with_backoff,
};
use kestrel_sharding::{ModelShapes, PartitionPlan, plan};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{Collective, CollectiveError, DataSource, ShardState, ShardTrainer, WorkerError};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Step at which training ends.
    pub target_steps: u64,
    /// Commit a checkpoint every this many steps. 0 disables periodic commits.
    pub checkpoint_every: u64,
    /// Log averaged metrics every this many steps. 0 disables them.
    pub log_every: u64,
    /// Accelerator lock files a crashed predecessor may have left behind.
    pub stale_lockfiles: Vec<PathBuf>,
    /// Attempts at the commit that ends training. The worker fails when none
    /// of them is finalized.
    pub final_commit_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            target_steps: 100,
            checkpoint_every: 20,
            log_every: 10,
            stale_lockfiles: vec![],
            final_commit_retry: RetryPolicy::new(3, Duration::from_secs(1)),
        }
    }
}

/// Everything one rank needs to train.
pub struct WorkerContext {
    pub job_id: JobId,
    pub rank: Rank,
    pub topology: Arc<Topology>,
    pub model: Arc<ModelShapes>,
    pub base_model: ArtifactRef,
    pub cache: Arc<CacheManager>,
    pub checkpoints: CheckpointStore,
    pub collective: Arc<dyn Collective>,
    pub trainer: Arc<dyn ShardTrainer>,
    pub data: Arc<dyn DataSource>,
    pub events: UnboundedSender<WorkerEvent>,
    /// Cooperative stop signal. Read after each forward/backward pass, so the
    /// step in flight finishes before the final commit.
    pub stop: CancellationToken,
    pub config: WorkerConfig,
}

struct OwnedShards {
    states: Vec<ShardState>,
    trainable: Vec<bool>,
}

pub struct WorkerRuntime {
    ctx: WorkerContext,
    step: u64,
}

impl WorkerRuntime {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx, step: 0 }
    }

    /// Trains from `resume_from` (or from the base model) until the target
    /// step or a stop request, then reports the outcome on the event channel.
    pub async fn run(
        mut self,
        resume_from: Option<CheckpointRecord>,
    ) -> Result<WorkerOutcome, WorkerError> {
        let span = info_span!("worker", job_id = %self.ctx.job_id, rank = %self.ctx.rank);
        async move {
            let result = self.train(resume_from.as_ref()).await;
            let rank = self.ctx.rank;
            match &result {
                Ok(outcome) => {
                    info!(
                        final_step = outcome.final_step,
                        commits = outcome.commits,
                        exit = ?outcome.exit,
                        "Worker finished"
                    );
                    self.send(WorkerEvent::Exited {
                        rank,
                        result: Ok(outcome.clone()),
                    });
                }
                Err(err) => {
                    error!(step = self.step, error = %err, "Worker failed");
                    let status = if err.is_stall() {
                        HealthStatus::Stalled
                    } else {
                        HealthStatus::Failed
                    };
                    self.heartbeat(status);
                    self.ctx.collective.abort(rank, &err.to_string());
                    self.send(WorkerEvent::Exited {
                        rank,
                        result: Err(err.to_string()),
                    });
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    fn send(&self, event: WorkerEvent) {
        if self.ctx.events.send(event).is_err() {
            debug!("Event receiver is gone");
        }
    }

    fn heartbeat(&self, status: HealthStatus) {
        self.send(WorkerEvent::Heartbeat(WorkerHeartbeat::now(
            self.ctx.rank,
            self.step,
            status,
        )));
    }

    async fn cleanup_lockfiles(&self) -> Result<(), WorkerError> {
        for path in &self.ctx.config.stale_lockfiles {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(path = %path.display(), "Removed stale accelerator lock file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(WorkerError::Lockfile {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    async fn train(
        &mut self,
        resume_from: Option<&CheckpointRecord>,
    ) -> Result<WorkerOutcome, WorkerError> {
        self.cleanup_lockfiles().await?;
        let plan = plan(&self.ctx.model, &self.ctx.topology)?;
        let model_dir = self.ctx.cache.ensure_local(&self.ctx.base_model).await?;
        let mut shards = self.load_shards(&plan, &model_dir, resume_from).await?;

        self.step = resume_from.map_or(0, |record| record.step);
        info!(
            step = self.step,
            shards = shards.states.len(),
            resumed = resume_from.is_some(),
            "Worker ready"
        );
        self.heartbeat(HealthStatus::Running);

        let config = self.ctx.config.clone();
        let (rank, world_size) = (self.ctx.rank, plan.world_size());
        let mut metrics = RunningAverage::new(config.log_every.max(1) as usize);
        let mut commits = 0;
        let mut exit_commit = None;

        let exit = loop {
            if self.step >= config.target_steps {
                break ExitReason::TargetReached;
            }
            let started = Instant::now();

            let batch = self
                .ctx
                .data
                .next_batch(rank, self.step)
                .await
                .map_err(WorkerError::Data)?;
            let output = self
                .ctx
                .trainer
                .forward_backward(&shards.states, &batch)
                .map_err(WorkerError::Trainer)?;

            // loss and stop vote ride along with the gradient summary, so every
            // rank sees the same decision after the same step
            let stop_requested = self.ctx.stop.is_cancelled();
            let contribution_len = output.contribution.len();
            let mut payload = output.contribution;
            payload.push(output.loss);
            payload.push(if stop_requested { 1.0 } else { 0.0 });
            let reduced = self
                .ctx
                .collective
                .all_reduce(rank, self.step, payload)
                .await?;
            let (gradients, tail) = reduced.split_at(contribution_len.min(reduced.len()));
            let [loss_sum, stop_votes] = tail else {
                return Err(CollectiveError::Poisoned(format!(
                    "expected {} reduced values, got {}",
                    contribution_len + 2,
                    reduced.len()
                ))
                .into());
            };
            let stopping = *stop_votes > 0.0;

            for (state, trainable) in shards.states.iter_mut().zip(&shards.trainable) {
                if *trainable {
                    self.ctx
                        .trainer
                        .apply_update(state, gradients, world_size)
                        .map_err(WorkerError::Trainer)?;
                }
            }
            self.step += 1;
            self.heartbeat(HealthStatus::Running);

            metrics.push("loss", (*loss_sum / world_size as f32) as f64);
            metrics.push("step_time", started.elapsed().as_secs_f64());
            if config.log_every > 0 && self.step % config.log_every == 0 {
                info!(
                    step = self.step,
                    loss = metrics.average("loss"),
                    step_time_secs = metrics.average("step_time"),
                    "Training progress"
                );
            }

            if stopping || self.step >= config.target_steps {
                if stopping {
                    info!(step = self.step, "Stop requested, committing final checkpoint");
                }
                self.final_commit(&plan, &shards).await?;
                commits += 1;
                exit_commit = Some(self.step);
                break if stopping {
                    ExitReason::StopRequested
                } else {
                    ExitReason::TargetReached
                };
            }
            if config.checkpoint_every > 0
                && self.step % config.checkpoint_every == 0
                && self.commit(&plan, &shards).await?
            {
                commits += 1;
            }
        };

        Ok(WorkerOutcome {
            rank,
            final_step: self.step,
            commits,
            exit_commit,
            exit,
        })
    }

    async fn load_shards(
        &self,
        plan: &PartitionPlan,
        model_dir: &Path,
        resume_from: Option<&CheckpointRecord>,
    ) -> Result<OwnedShards, WorkerError> {
        if let Some(record) = resume_from {
            let expected = plan.fingerprint();
            if record.plan_fingerprint != expected {
                return Err(WorkerError::PlanMismatch {
                    step: record.step,
                    expected,
                    found: record.plan_fingerprint,
                });
            }
        }

        let owned = plan.shards_for_rank(self.ctx.rank);
        let mut shards = OwnedShards {
            states: Vec::with_capacity(owned.len()),
            trainable: Vec::with_capacity(owned.len()),
        };
        for (tensor, shard) in owned {
            let state = match resume_from {
                Some(record) if tensor.trainable => {
                    let bytes = match self.ctx.checkpoints.load_shard(record, &shard.id).await {
                        Ok(bytes) => bytes,
                        Err(err @ CheckpointError::ChecksumMismatch { .. }) => {
                            if let Err(mark_err) = self.ctx.checkpoints.mark_corrupt(record).await {
                                warn!(error = %mark_err, "Couldn't mark checkpoint corrupt");
                            }
                            return Err(err.into());
                        }
                        Err(err) => return Err(err.into()),
                    };
                    let state = ShardState::decode(&bytes)?;
                    if state.shard != shard.id {
                        return Err(WorkerError::WrongShard {
                            expected: shard.id.clone(),
                            found: state.shard,
                        });
                    }
                    state
                }
                _ => self
                    .ctx
                    .trainer
                    .load_shard(model_dir, tensor, shard)
                    .map_err(WorkerError::Trainer)?,
            };
            shards.states.push(state);
            shards.trainable.push(tensor.trainable);
        }
        Ok(shards)
    }

    /// Commit that ends training, retried while the ranks agree it was not
    /// finalized.
    async fn final_commit(
        &self,
        plan: &PartitionPlan,
        shards: &OwnedShards,
    ) -> Result<(), WorkerError> {
        let step = self.step;
        let policy = self.ctx.config.final_commit_retry;
        retry_with_backoff(
            policy,
            "Final checkpoint commit",
            |err: &WorkerError| matches!(err, WorkerError::FinalCommit { .. }),
            move || async move {
                if self.commit(plan, shards).await? {
                    Ok(())
                } else {
                    Err(WorkerError::FinalCommit {
                        step,
                        attempts: policy.max_attempts,
                    })
                }
            },
        )
        .await
    }

    /// Cross-rank commit of the current step. Every rank takes the same
    /// branches, since each decision is made on an all-reduced vote. Returns
    /// whether the checkpoint was finalized.
    async fn commit(
        &self,
        plan: &PartitionPlan,
        shards: &OwnedShards,
    ) -> Result<bool, WorkerError> {
        let ctx = &self.ctx;
        let (rank, step) = (ctx.rank, self.step);
        let leader = rank == ctx.topology.leader();

        let mut record = None;
        let mut failed = false;
        if leader {
            match ctx.checkpoints.begin_commit(&ctx.job_id, step, plan).await {
                Ok(begun) => record = Some(begun),
                Err(err) => {
                    warn!(step, error = %err, "Couldn't begin checkpoint commit");
                    failed = true;
                }
            }
        }
        if !self.vote(step, failed).await? {
            return Ok(false);
        }

        if !leader {
            match ctx.checkpoints.open_commit(&ctx.job_id, step).await {
                Ok(opened) => record = Some(opened),
                Err(err) => {
                    warn!(step, error = %err, "Couldn't open checkpoint commit");
                    failed = true;
                }
            }
        }
        if let Some(record) = &record {
            for (state, trainable) in shards.states.iter().zip(&shards.trainable) {
                if !*trainable {
                    continue;
                }
                if let Err(err) = self.upload(record, state).await {
                    warn!(step, shard = %state.shard, error = %err, "Shard upload failed");
                    failed = true;
                    break;
                }
            }
        }
        if !self.vote(step, failed).await? {
            warn!(step, "A rank failed to upload its shards, abandoning checkpoint");
            return Ok(false);
        }

        let mut finalize_failed = false;
        if let (true, Some(record)) = (leader, &record) {
            match ctx.checkpoints.finalize(record).await {
                Ok(_) => {}
                Err(err) => {
                    warn!(step, error = %err, "Checkpoint not finalized");
                    finalize_failed = true;
                }
            }
        }
        self.vote(step, finalize_failed).await
    }

    async fn upload(&self, record: &CheckpointRecord, state: &ShardState) -> Result<(), WorkerError> {
        let bytes = state.encode()?;
        self.ctx
            .checkpoints
            .upload_shard(record, &state.shard, Bytes::from(bytes))
            .await?;
        Ok(())
    }

    /// All-reduces a failure flag. True when no rank failed.
    async fn vote(&self, step: u64, failed: bool) -> Result<bool, WorkerError> {
        let votes = self
            .ctx
            .collective
            .all_reduce(self.ctx.rank, step, vec![if failed { 1.0 } else { 0.0 }])
            .await?;
        Ok(votes.first().is_some_and(|v| *v == 0.0))
    }
}
