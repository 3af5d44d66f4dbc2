use anyhow::{Result, bail};
use async_trait::async_trait;
use kestrel_cache::{
    ArtifactRef, CacheConfig, CacheManager, Credentials, HubError, LocalDirHub, ModelHub,
};
use kestrel_checkpoint::{CheckpointStore, LocalObjectStore, MemoryObjectStore};
use kestrel_coordinator::{
    ConfigError, FailureReason, JobCoordinator, JobSpec, JobState, JobStatus, LaunchRequest,
    LocalCluster, Resources, RestartPolicy, SubmitError, SyntheticWorkerFactory, WorkerExit,
    WorkerFactory, WorkerWiring,
};
use kestrel_core::{AcceleratorKind, JobId, Rank};
use kestrel_sharding::{
    ModelShapes, PlanError, ShardAssignment, TensorPartition, TensorSpec,
};
use kestrel_worker::{
    Batch, DataSource, DummyTrainer, ShardState, ShardTrainer, StepOutput, WorkerContext,
};
use pretty_assertions::assert_eq;
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;

const POLL: Duration = Duration::from_millis(50);

fn model() -> ModelShapes {
    ModelShapes::new(vec![TensorSpec::new("w", [4, 8]), TensorSpec::new("b", [8])])
}

/// Fails `forward_backward` once, on the rank owning shard index 1, at
/// `step`.
struct FailingTrainer {
    inner: DummyTrainer,
    step: u64,
    armed: AtomicBool,
}

impl FailingTrainer {
    fn once_at(step: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: DummyTrainer::default(),
            step,
            armed: AtomicBool::new(true),
        })
    }
}

impl ShardTrainer for FailingTrainer {
    fn load_shard(
        &self,
        model_dir: &Path,
        tensor: &TensorPartition,
        shard: &ShardAssignment,
    ) -> Result<ShardState> {
        self.inner.load_shard(model_dir, tensor, shard)
    }

    fn forward_backward(&self, shards: &[ShardState], batch: &Batch) -> Result<StepOutput> {
        let second_rank = shards.iter().any(|s| s.shard.index == 1);
        if second_rank && batch.step == self.step && self.armed.swap(false, Ordering::SeqCst) {
            bail!("injected fault at step {}", batch.step);
        }
        self.inner.forward_backward(shards, batch)
    }

    fn apply_update(&self, shard: &mut ShardState, reduced: &[f32], world_size: u32) -> Result<()> {
        self.inner.apply_update(shard, reduced, world_size)
    }
}

/// Never finishes a fetch, so workers never get past startup.
struct HangingHub;

#[async_trait]
impl ModelHub for HangingHub {
    async fn fetch(&self, _: &ArtifactRef, _: &Path, _: &Credentials) -> Result<u64, HubError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(HubError::Network("unreachable".into()))
    }
}

/// Blocks rank 1 forever once it asks for the batch of `step`.
struct StallingData {
    inner: Arc<dyn DataSource>,
    step: u64,
}

#[async_trait]
impl DataSource for StallingData {
    async fn next_batch(&self, rank: Rank, step: u64) -> Result<Batch> {
        if rank == Rank(1) && step >= self.step {
            std::future::pending::<()>().await;
        }
        self.inner.next_batch(rank, step).await
    }
}

struct StallingFactory(SyntheticWorkerFactory);

impl WorkerFactory for StallingFactory {
    fn build(
        &self,
        request: &LaunchRequest,
        rank: Rank,
        wiring: WorkerWiring,
    ) -> Result<WorkerContext> {
        let mut ctx = self.0.build(request, rank, wiring)?;
        ctx.data = Arc::new(StallingData {
            inner: ctx.data,
            step: 2,
        });
        Ok(ctx)
    }
}

struct Harness {
    dir: TempDir,
    checkpoints: CheckpointStore,
    base_model: ArtifactRef,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base-model");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(base.join("model.safetensors"), vec![0u8; 64]).unwrap();
        Self {
            checkpoints: CheckpointStore::new(Arc::new(MemoryObjectStore::new())),
            base_model: ArtifactRef::local(base),
            dir,
        }
    }

    fn cache(&self, hub: Arc<dyn ModelHub>) -> Arc<CacheManager> {
        Arc::new(CacheManager::new(
            CacheConfig::new(self.dir.path().join("cache")),
            hub,
        ))
    }

    fn factory(&self, trainer: Arc<dyn ShardTrainer>) -> SyntheticWorkerFactory {
        SyntheticWorkerFactory::new(self.cache(Arc::new(LocalDirHub)), trainer)
    }

    fn coordinator(&self, factory: impl WorkerFactory + 'static) -> JobCoordinator {
        JobCoordinator::with_poll_interval(
            Arc::new(LocalCluster::new(Arc::new(factory))),
            self.checkpoints.clone(),
            POLL,
        )
    }

    fn spec(&self, job: &str, env: &[(&str, &str)]) -> JobSpec {
        let mut spec = JobSpec::new(
            JobId::new(job).unwrap(),
            "kestrel-worker",
            2,
            Resources {
                accelerator: AcceleratorKind::Cpu,
                accelerators_per_worker: 1,
            },
        )
        .unwrap()
        .with_env("KESTREL_BASE_MODEL", self.base_model.to_string());
        for (key, value) in env {
            spec = spec.with_env(*key, *value);
        }
        spec
    }
}

async fn wait(coordinator: &JobCoordinator, job_id: &JobId) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(30), coordinator.wait(job_id))
        .await
        .expect("job did not finish")
        .unwrap()
}

async fn wait_until_running(coordinator: &JobCoordinator, job_id: &JobId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while coordinator.status(job_id).map(|s| s.state) != Some(JobState::Running) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never started running");
}

fn final_steps(status: &JobStatus) -> Vec<u64> {
    status
        .workers
        .iter()
        .map(|worker| match &worker.exit {
            Some(WorkerExit::Succeeded { final_step, .. }) => *final_step,
            other => panic!("rank {} did not succeed: {other:?}", worker.rank),
        })
        .collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_job_completes_and_retains_checkpoints() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(harness.factory(Arc::new(DummyTrainer::default())));
    let spec = harness.spec(
        "complete",
        &[
            ("KESTREL_TARGET_STEPS", "6"),
            ("KESTREL_CHECKPOINT_EVERY", "2"),
            ("KESTREL_KEEP_CHECKPOINTS", "2"),
        ],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.last_error, None);
    assert_eq!(final_steps(&status), vec![6, 6]);
    assert_eq!(status.resume_step, Some(6));

    let steps = harness
        .checkpoints
        .records(&job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.step)
        .collect::<Vec<_>>();
    assert_eq!(steps, vec![4, 6]);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_bucket_and_cache_dir_from_job_config() {
    let harness = Harness::new();
    let bucket = harness.dir.path().join("bucket");
    let cache_dir = harness.dir.path().join("job-cache");
    let coordinator = harness.coordinator(harness.factory(Arc::new(DummyTrainer::default())));
    let spec = harness.spec(
        "bucketed",
        &[
            ("KESTREL_TARGET_STEPS", "2"),
            ("KESTREL_CHECKPOINT_EVERY", "0"),
            ("KESTREL_BUCKET", bucket.to_str().unwrap()),
            ("KESTREL_CACHE_DIR", cache_dir.to_str().unwrap()),
        ],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.resume_step, Some(2));

    assert!(bucket.join("bucketed/step-000000000002/record.json").is_file());
    let in_bucket = CheckpointStore::new(Arc::new(LocalObjectStore::new(bucket.clone())));
    assert_eq!(
        in_bucket.latest_committed(&job_id).await.unwrap().unwrap().step,
        2
    );
    assert!(harness.checkpoints.records(&job_id).await.unwrap().is_empty());

    assert!(std::fs::read_dir(&cache_dir).unwrap().next().is_some());
    assert!(!harness.dir.path().join("cache").exists());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_stop_commits_once_then_resumes() {
    let harness = Harness::new();
    let factory = harness
        .factory(Arc::new(DummyTrainer::default()))
        .with_step_delay(Duration::from_millis(5));
    let coordinator = harness.coordinator(factory);
    let spec = harness.spec(
        "stoppable",
        &[
            ("KESTREL_TARGET_STEPS", "100000"),
            ("KESTREL_CHECKPOINT_EVERY", "0"),
        ],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    wait_until_running(&coordinator, &job_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.stop(&job_id).unwrap();
    let status = wait(&coordinator, &job_id).await;

    assert_eq!(status.state, JobState::Stopped);
    let steps = final_steps(&status);
    assert_eq!(steps[0], steps[1]);
    for worker in &status.workers {
        assert!(matches!(
            worker.exit,
            Some(WorkerExit::Succeeded { commits: 1, .. })
        ));
    }
    let records = harness.checkpoints.records(&job_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step, steps[0]);
    assert_eq!(status.resume_step, Some(steps[0]));

    // resubmitting the same identity continues from the stop
    let target = steps[0] + 2;
    let target_steps = target.to_string();
    let spec = harness.spec(
        "stoppable",
        &[
            ("KESTREL_TARGET_STEPS", target_steps.as_str()),
            ("KESTREL_CHECKPOINT_EVERY", "0"),
        ],
    );
    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(final_steps(&status), vec![target, target]);
    let latest = harness
        .checkpoints
        .latest_committed(&job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.step, target);

    // the next run picks up the completed run's last commit, not the stop
    let next = target + 2;
    let next_steps = next.to_string();
    let spec = harness.spec(
        "stoppable",
        &[
            ("KESTREL_TARGET_STEPS", next_steps.as_str()),
            ("KESTREL_CHECKPOINT_EVERY", "0"),
        ],
    );
    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(final_steps(&status), vec![next, next]);
    let steps = harness
        .checkpoints
        .records(&job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.step)
        .collect::<Vec<_>>();
    assert_eq!(steps.last(), Some(&next));
    assert!(steps.contains(&target));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_early_stop_file() {
    let harness = Harness::new();
    let stop_file = harness.dir.path().join("EARLY_STOP");
    let factory = harness
        .factory(Arc::new(DummyTrainer::default()))
        .with_step_delay(Duration::from_millis(5));
    let coordinator = harness.coordinator(factory);
    let spec = harness.spec(
        "early-stop",
        &[
            ("KESTREL_TARGET_STEPS", "100000"),
            ("KESTREL_EARLY_STOP_FILE", stop_file.to_str().unwrap()),
        ],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    wait_until_running(&coordinator, &job_id).await;
    std::fs::write(&stop_file, b"").unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Stopped);
    assert!(status.resume_step.is_some());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_worker_failure_fails_job() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(harness.factory(FailingTrainer::once_at(3)));
    let spec = harness.spec(
        "failing",
        &[
            ("KESTREL_TARGET_STEPS", "10"),
            ("KESTREL_CHECKPOINT_EVERY", "2"),
        ],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(matches!(
        status.failure,
        Some(FailureReason::WorkerFailed { rank: Rank(1), .. })
    ));
    assert!(status.last_error.unwrap().starts_with("rank 1 failed"));
    assert_eq!(status.resume_step, Some(2));
    assert_eq!(status.restarts, 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_restart_resumes_from_last_commit() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(harness.factory(FailingTrainer::once_at(3)));
    let spec = harness
        .spec(
            "restarting",
            &[
                ("KESTREL_TARGET_STEPS", "6"),
                ("KESTREL_CHECKPOINT_EVERY", "2"),
            ],
        )
        .with_restart_policy(RestartPolicy::OnFailure { max_restarts: 2 });

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.restarts, 1);
    assert_eq!(final_steps(&status), vec![6, 6]);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_startup_timeout() {
    let harness = Harness::new();
    let factory = SyntheticWorkerFactory::new(
        harness.cache(Arc::new(HangingHub)),
        Arc::new(DummyTrainer::default()),
    );
    let coordinator = harness.coordinator(factory);
    let spec = harness.spec("slow-start", &[("KESTREL_STARTUP_TIMEOUT_SECS", "1")]);

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    assert_eq!(coordinator.status(&job_id).unwrap().state, JobState::Submitted);
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(matches!(
        status.failure,
        Some(FailureReason::StartupTimeout { .. })
    ));
    assert!(status.last_error.unwrap().starts_with("StartupTimeout"));
    assert!(status.workers.iter().all(|worker| worker.health.is_none()));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_stall_timeout() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(StallingFactory(
        harness.factory(Arc::new(DummyTrainer::default())),
    ));
    let spec = harness.spec(
        "stalling",
        &[
            ("KESTREL_TARGET_STEPS", "10"),
            ("KESTREL_STALL_TIMEOUT_SECS", "1"),
        ],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(matches!(
        status.failure,
        Some(FailureReason::StallTimeout { .. })
    ));
}

#[tokio::test]
async fn test_unknown_config_key_rejected() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(harness.factory(Arc::new(DummyTrainer::default())));
    let spec = harness.spec("typo", &[("KESTREL_TARGET_STEP", "10")]);
    let job_id = spec.job_id.clone();

    let err = coordinator.submit(spec, model()).await.unwrap_err();
    assert!(
        matches!(&err, SubmitError::Config(ConfigError::UnrecognizedKey(key)) if key == "KESTREL_TARGET_STEP"),
        "{err}"
    );
    assert!(coordinator.status(&job_id).is_none());
}

#[tokio::test]
async fn test_infeasible_topology_never_starts() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(harness.factory(Arc::new(DummyTrainer::default())));
    let spec = harness.spec("odd", &[]);
    let job_id = spec.job_id.clone();

    let odd = ModelShapes::new(vec![TensorSpec::new("w", [3, 5])]);
    let err = coordinator.submit(spec, odd).await.unwrap_err();
    assert!(
        matches!(&err, SubmitError::InfeasibleTopology(PlanError::InfeasibleTopology(_))),
        "{err}"
    );
    assert!(coordinator.status(&job_id).is_none());
    assert!(harness.checkpoints.records(&job_id).await.unwrap().is_empty());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_adapter_training_checkpoints_only_adapters() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(harness.factory(Arc::new(DummyTrainer::default())));
    let spec = harness.spec(
        "lora",
        &[("KESTREL_TARGET_STEPS", "2"), ("KESTREL_TRAINING_MODE", "lora:2")],
    );

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    let latest = harness
        .checkpoints
        .latest_committed(&job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!latest.manifest.is_empty());
    assert!(latest
        .manifest
        .iter()
        .all(|shard| shard.tensor.starts_with("w.lora_")));
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn test_process_cluster_job() {
    use kestrel_coordinator::ProcessCluster;

    let harness = Harness::new();
    let coordinator = JobCoordinator::with_poll_interval(
        Arc::new(ProcessCluster::new(harness.dir.path().join("state"))),
        harness.checkpoints.clone(),
        POLL,
    );
    let mut spec = harness.spec("processes", &[]);
    spec.command = r#"
        for step in 0 1 2; do
            echo "{\"event\":\"heartbeat\",\"rank\":$KESTREL_RANK,\"step\":$step,\"timestamp\":\"2024-01-01T00:00:00Z\",\"status\":\"running\"}"
        done
    "#
    .to_string();

    let job_id = coordinator.submit(spec, model()).await.unwrap();
    let status = wait(&coordinator, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(final_steps(&status), vec![2, 2]);
}
