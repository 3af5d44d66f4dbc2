use anyhow::{Context, Result};
use async_trait::async_trait;
use kestrel_cache::CacheManager;
use kestrel_core::{JobId, Rank, Topology, WorkerEvent};
use kestrel_sharding::plan_data;
use kestrel_worker::{
    Collective, LocalCollective, ShardTrainer, SyntheticData, WorkerContext, WorkerRuntime,
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::mpsc::{UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::{ClusterBackend, ClusterError, JobConfig, JobSpec, LaunchRequest, WorkerEvents};

/// Per-launch plumbing shared by every rank of a local job.
#[derive(Clone)]
pub struct WorkerWiring {
    pub collective: Arc<dyn Collective>,
    pub events: UnboundedSender<WorkerEvent>,
    pub stop: CancellationToken,
}

/// Builds the context of one in-process worker.
pub trait WorkerFactory: Send + Sync {
    fn build(
        &self,
        request: &LaunchRequest,
        rank: Rank,
        wiring: WorkerWiring,
    ) -> Result<WorkerContext>;
}

/// Workers training on a synthetic token stream with the caller's trainer.
/// Checkpoints go to the launch's store. `cache` serves jobs that configure
/// no cache directory.
pub struct SyntheticWorkerFactory {
    pub cache: Arc<CacheManager>,
    pub trainer: Arc<dyn ShardTrainer>,
    pub num_examples: u64,
    pub batch_size: u64,
    pub seq_len: usize,
    /// Simulated data loading time per step.
    pub step_delay: Duration,
    caches: Mutex<HashMap<PathBuf, Arc<CacheManager>>>,
}

impl SyntheticWorkerFactory {
    pub fn new(cache: Arc<CacheManager>, trainer: Arc<dyn ShardTrainer>) -> Self {
        Self {
            cache,
            trainer,
            num_examples: 1024,
            batch_size: 4,
            seq_len: 16,
            step_delay: Duration::ZERO,
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// One manager per cache directory, shared by every rank using it.
    fn cache_for(&self, config: &JobConfig) -> Result<Arc<CacheManager>> {
        if config.cache_dir.is_none() {
            return Ok(self.cache.clone());
        }
        let root = config.cache_config()?.root;
        if root == self.cache.config().root {
            return Ok(self.cache.clone());
        }
        let mut caches = self.caches.lock().unwrap();
        let cache = caches
            .entry(root)
            .or_insert_with_key(|root| Arc::new(self.cache.relocated(root.clone())));
        Ok(cache.clone())
    }
}

impl WorkerFactory for SyntheticWorkerFactory {
    fn build(
        &self,
        request: &LaunchRequest,
        rank: Rank,
        wiring: WorkerWiring,
    ) -> Result<WorkerContext> {
        let config = &request.config;
        let base_model = config
            .base_model
            .clone()
            .context("no base model configured")?;
        let partition = plan_data(self.num_examples, &request.topology, config.data_sharding)?;
        let accelerator = &request.spec.resources.accelerator;
        Ok(WorkerContext {
            job_id: request.spec.job_id.clone(),
            rank,
            topology: request.topology.clone(),
            model: request.model.clone(),
            base_model,
            cache: self.cache_for(config)?,
            checkpoints: request.checkpoints.clone(),
            collective: wiring.collective,
            trainer: self.trainer.clone(),
            data: Arc::new(
                SyntheticData::new(partition, self.batch_size, self.seq_len)
                    .with_delay(self.step_delay),
            ),
            events: wiring.events,
            stop: wiring.stop,
            config: config.worker_config(accelerator),
        })
    }
}

struct LocalJob {
    stop: CancellationToken,
    collective: Arc<LocalCollective>,
    tasks: Vec<JoinHandle<()>>,
}

/// Runs every rank as a tokio task of this process, joined by a
/// [`LocalCollective`].
pub struct LocalCluster {
    factory: Arc<dyn WorkerFactory>,
    host: String,
    jobs: Mutex<HashMap<JobId, LocalJob>>,
}

impl LocalCluster {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            host: "local".to_string(),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClusterBackend for LocalCluster {
    async fn topology(&self, spec: &JobSpec) -> Result<Topology, ClusterError> {
        Ok(Topology::uniform(
            spec.worker_count,
            &self.host,
            spec.resources.accelerator.clone(),
            spec.resources.accelerators_per_worker,
        )?)
    }

    async fn launch(&self, request: LaunchRequest) -> Result<WorkerEvents, ClusterError> {
        let job_id = request.spec.job_id.clone();
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.get(&job_id) {
            if existing.tasks.iter().any(|task| !task.is_finished()) {
                return Err(ClusterError::AlreadyRunning(job_id));
            }
        }

        let world_size = request.topology.world_size();
        let collective = Arc::new(LocalCollective::new(
            world_size,
            request.config.stall_timeout(),
        ));
        let stop = CancellationToken::new();
        let (events, rx) = unbounded_channel();
        let resume_from = request.resume_from.clone();

        let mut tasks = Vec::with_capacity(world_size as usize);
        for rank in request.topology.ranks() {
            let wiring = WorkerWiring {
                collective: collective.clone(),
                events: events.clone(),
                stop: stop.clone(),
            };
            match self.factory.build(&request, rank, wiring) {
                Ok(ctx) => {
                    let resume_from = resume_from.clone();
                    let span = info_span!("local_worker", attempt = request.attempt);
                    tasks.push(tokio::spawn(
                        async move {
                            // outcome is reported on the event channel
                            let _ = WorkerRuntime::new(ctx).run(resume_from).await;
                        }
                        .instrument(span),
                    ));
                }
                Err(err) => {
                    warn!(job_id = %job_id, rank = %rank, error = %err, "Couldn't build worker");
                    collective.abort(rank, "worker could not be built");
                    let _ = events.send(WorkerEvent::Exited {
                        rank,
                        result: Err(format!("{err:#}")),
                    });
                }
            }
        }
        info!(job_id = %job_id, world_size, attempt = request.attempt, "Launched local workers");
        jobs.insert(
            job_id,
            LocalJob {
                stop,
                collective,
                tasks,
            },
        );
        Ok(rx)
    }

    async fn request_stop(&self, job_id: &JobId) -> Result<(), ClusterError> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| ClusterError::UnknownJob(job_id.clone()))?;
        job.stop.cancel();
        Ok(())
    }

    async fn terminate(&self, job_id: &JobId) -> Result<(), ClusterError> {
        let job = self
            .jobs
            .lock()
            .unwrap()
            .remove(job_id)
            .ok_or_else(|| ClusterError::UnknownJob(job_id.clone()))?;
        job.collective.abort(Rank(0), "job terminated");
        for task in &job.tasks {
            task.abort();
        }
        info!(job_id = %job_id, "Terminated local workers");
        Ok(())
    }
}
