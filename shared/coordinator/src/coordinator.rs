use chrono::Utc;
use kestrel_checkpoint::{CheckpointError, CheckpointStore};
use kestrel_core::{HealthStatus, JobId, WorkerEvent};
use kestrel_sharding::{ModelShapes, PlanError, plan};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    ClusterBackend, ClusterError, ConfigError, FailureReason, JobEvent, JobSpec, JobState,
    JobStatus, LaunchRequest, ResumeMode, RestartPolicy, TrainingMode, WorkerEvents,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid job configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("InfeasibleTopology: {0}")]
    InfeasibleTopology(#[from] PlanError),

    #[error("checkpoint at step {step} was written with a different sharding plan")]
    ResumeMismatch { step: u64 },

    #[error("job {0} is still active")]
    AlreadyActive(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

struct JobHandle {
    status: watch::Receiver<JobStatus>,
    stop: CancellationToken,
}

struct Inner {
    cluster: Arc<dyn ClusterBackend>,
    checkpoints: CheckpointStore,
    poll_interval: Duration,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
}

/// Submits jobs to a cluster and drives each through its lifecycle.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(cluster: Arc<dyn ClusterBackend>, checkpoints: CheckpointStore) -> Self {
        Self::with_poll_interval(cluster, checkpoints, DEFAULT_POLL_INTERVAL)
    }

    /// `poll_interval` bounds how late timeouts and the early-stop file are
    /// noticed.
    pub fn with_poll_interval(
        cluster: Arc<dyn ClusterBackend>,
        checkpoints: CheckpointStore,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                checkpoints,
                poll_interval,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates, plans and launches `spec` training `model`. Nothing is
    /// launched when the job cannot be planned.
    pub async fn submit(&self, spec: JobSpec, model: ModelShapes) -> Result<JobId, SubmitError> {
        let job_id = spec.job_id.clone();
        let config = spec.resolve_config()?;
        if let Some(handle) = self.inner.jobs.lock().unwrap().get(&job_id) {
            if !handle.status.borrow().state.is_terminal() {
                return Err(SubmitError::AlreadyActive(job_id));
            }
        }

        let topology = self.inner.cluster.topology(&spec).await?;
        let model = match config.training_mode {
            TrainingMode::Full => model,
            TrainingMode::Lora { rank } => ModelShapes::with_adapter(&model, rank),
        };
        let plan = plan(&model, &topology).inspect_err(|err| {
            warn!(job_id = %job_id, error = %err, "Rejecting job that cannot be planned");
        })?;

        let checkpoints = match &config.bucket {
            Some(bucket) => {
                info!(job_id = %job_id, bucket = %bucket, "Using job checkpoint bucket");
                CheckpointStore::new(config.object_store().await?)
            }
            None => self.inner.checkpoints.clone(),
        }
        .with_keep_committed(config.keep_checkpoints);
        let resume_from = match config.resume {
            ResumeMode::Auto => checkpoints.resolve_resume(&job_id).await?,
            ResumeMode::Fresh => None,
        };
        if let Some(record) = &resume_from {
            if record.plan_fingerprint != plan.fingerprint() {
                return Err(SubmitError::ResumeMismatch { step: record.step });
            }
            info!(job_id = %job_id, step = record.step, "Resuming from checkpoint");
        }

        let world_size = topology.world_size();
        let request = LaunchRequest {
            spec: Arc::new(spec),
            config: Arc::new(config),
            topology: Arc::new(topology),
            model: Arc::new(model),
            resume_from,
            checkpoints: checkpoints.clone(),
            attempt: 0,
        };
        let events = self.inner.cluster.launch(request.clone()).await?;

        let status = JobStatus::new(job_id.clone(), world_size);
        let (publish, status_rx) = watch::channel(status.clone());
        let stop = CancellationToken::new();
        self.inner.jobs.lock().unwrap().insert(
            job_id.clone(),
            JobHandle {
                status: status_rx,
                stop: stop.clone(),
            },
        );

        let monitor = Monitor {
            cluster: self.inner.cluster.clone(),
            checkpoints,
            poll_interval: self.inner.poll_interval,
            request,
            status,
            publish,
            stop,
        };
        tokio::spawn(
            monitor
                .run(events)
                .instrument(info_span!("job", job_id = %job_id)),
        );
        info!(job_id = %job_id, world_size, "Job submitted");
        Ok(job_id)
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        let jobs = self.inner.jobs.lock().unwrap();
        jobs.get(job_id).map(|handle| handle.status.borrow().clone())
    }

    /// Asks every worker of `job_id` to commit a final checkpoint and exit.
    pub fn stop(&self, job_id: &JobId) -> Result<(), SubmitError> {
        let jobs = self.inner.jobs.lock().unwrap();
        let handle = jobs
            .get(job_id)
            .ok_or_else(|| SubmitError::UnknownJob(job_id.clone()))?;
        info!(job_id = %job_id, "Stop requested");
        handle.stop.cancel();
        Ok(())
    }

    /// Waits until `job_id` reaches a terminal state.
    pub async fn wait(&self, job_id: &JobId) -> Option<JobStatus> {
        let mut status = {
            let jobs = self.inner.jobs.lock().unwrap();
            jobs.get(job_id)?.status.clone()
        };
        if status.wait_for(|s| s.state.is_terminal()).await.is_err() {
            debug!(job_id = %job_id, "Job monitor is gone");
        }
        let terminal = status.borrow().clone();
        Some(terminal)
    }
}

/// Watches one job's workers and applies the lifecycle rules.
struct Monitor {
    cluster: Arc<dyn ClusterBackend>,
    checkpoints: CheckpointStore,
    poll_interval: Duration,
    request: LaunchRequest,
    status: JobStatus,
    publish: watch::Sender<JobStatus>,
    stop: CancellationToken,
}

impl Monitor {
    fn job_id(&self) -> &JobId {
        &self.request.spec.job_id
    }

    async fn run(mut self, mut events: WorkerEvents) {
        loop {
            self.watch_attempt(&mut events).await;
            self.explain_failure(&mut events);

            let job_id = self.job_id().clone();
            if let Err(err) = self.cluster.terminate(&job_id).await {
                debug!(error = %err, "Workers already gone");
            }

            match self.status.state {
                JobState::Failed => {
                    error!(error = self.status.last_error.as_deref().unwrap_or(""), "Job failed");
                    self.record_resume_point().await;
                    if self.should_restart() {
                        match self.relaunch().await {
                            Ok(next) => {
                                events = next;
                                continue;
                            }
                            Err(err) => {
                                error!(error = %err, "Restart failed");
                                self.status.state = JobState::Failed;
                                self.status.last_error = Some(format!("restart failed: {err}"));
                            }
                        }
                    }
                }
                JobState::Stopped => {
                    info!("Job stopped");
                    self.record_resume_point().await;
                }
                JobState::Completed => {
                    info!("Job completed");
                    self.record_resume_point().await;
                    self.retain_checkpoints().await;
                }
                JobState::Submitted | JobState::Running => {}
            }
            self.publish.send_replace(self.status.clone());
            return;
        }
    }

    async fn watch_attempt(&mut self, events: &mut WorkerEvents) {
        let config = self.request.config.clone();
        let startup_deadline = Instant::now() + config.startup_timeout();
        let stall_timeout = config.stall_timeout();
        let world_size = self.status.workers.len();
        let mut last_seen: Vec<Option<Instant>> = vec![None; world_size];
        let mut stop_sent = false;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.status.state.is_terminal() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event, &mut last_seen, stall_timeout),
                    None => self.apply(JobEvent::Failed(FailureReason::Lost(
                        "worker event stream closed".to_string(),
                    ))),
                },
                _ = self.stop.cancelled(), if !stop_sent => {
                    stop_sent = true;
                    if let Err(err) = self.cluster.request_stop(self.job_id()).await {
                        warn!(error = %err, "Couldn't deliver stop request");
                    }
                }
                _ = ticker.tick() => {
                    self.check_deadlines(startup_deadline, stall_timeout, &last_seen);
                    if let Some(path) = &config.early_stop_file {
                        if !self.stop.is_cancelled() && tokio::fs::try_exists(path).await.unwrap_or(false) {
                            info!(path = %path.display(), "Early stop file found");
                            self.stop.cancel();
                        }
                    }
                }
            }
            if !self.status.state.is_terminal() {
                self.publish.send_replace(self.status.clone());
            }
        }
    }

    fn apply(&mut self, event: JobEvent) {
        let from = self.status.state;
        if self.status.apply(event) {
            info!(from = %from, to = %self.status.state, "Job state changed");
        }
    }

    fn handle(
        &mut self,
        event: WorkerEvent,
        last_seen: &mut [Option<Instant>],
        stall_timeout: Duration,
    ) {
        match event {
            WorkerEvent::Heartbeat(heartbeat) => {
                let rank = heartbeat.rank;
                self.status.record_heartbeat(&heartbeat);
                if let Some(seen) = last_seen.get_mut(rank.index()) {
                    *seen = Some(Instant::now());
                }
                match heartbeat.status {
                    HealthStatus::Running => {
                        if self.status.state == JobState::Submitted && self.status.all_started() {
                            self.apply(JobEvent::AllStarted);
                        }
                    }
                    HealthStatus::Stalled => {
                        self.apply(JobEvent::Failed(FailureReason::StallTimeout {
                            rank,
                            timeout: stall_timeout,
                        }));
                    }
                    HealthStatus::Failed => {
                        self.apply(JobEvent::Failed(FailureReason::WorkerFailed {
                            rank,
                            error: format!("reported failed at step {}", heartbeat.step),
                        }));
                    }
                }
            }
            WorkerEvent::Exited { rank, result } => match self.status.record_exit(rank, &result) {
                Ok(()) => {
                    debug!(rank = %rank, "Worker exited");
                    if let Some(stopped) = self.status.all_succeeded() {
                        self.apply(JobEvent::AllExited { stopped });
                    }
                }
                Err(error) => {
                    self.apply(JobEvent::Failed(FailureReason::WorkerFailed { rank, error }));
                }
            },
        }
    }

    fn check_deadlines(
        &mut self,
        startup_deadline: Instant,
        stall_timeout: Duration,
        last_seen: &[Option<Instant>],
    ) {
        let now = Instant::now();
        match self.status.state {
            JobState::Submitted if now >= startup_deadline => {
                self.apply(JobEvent::Failed(FailureReason::StartupTimeout {
                    timeout: self.request.config.startup_timeout(),
                }));
            }
            JobState::Running => {
                let stale = self.status.workers.iter().find(|worker| {
                    worker.exit.is_none()
                        && last_seen
                            .get(worker.rank.index())
                            .copied()
                            .flatten()
                            .is_some_and(|seen| now.duration_since(seen) > stall_timeout)
                });
                if let Some(worker) = stale {
                    let rank = worker.rank;
                    self.apply(JobEvent::Failed(FailureReason::StallTimeout {
                        rank,
                        timeout: stall_timeout,
                    }));
                }
            }
            _ => {}
        }
    }

    /// A worker reports `failed` right before its exit event, which carries
    /// the actual error. Use it when it is already queued.
    fn explain_failure(&mut self, events: &mut WorkerEvents) {
        while let Ok(event) = events.try_recv() {
            let WorkerEvent::Exited {
                rank,
                result: Err(error),
            } = event
            else {
                continue;
            };
            if let Some(FailureReason::WorkerFailed {
                rank: failed_rank,
                error: reason,
            }) = &mut self.status.failure
            {
                if *failed_rank == rank && reason.starts_with("reported failed") {
                    *reason = error;
                    self.status.last_error = self.status.failure.as_ref().map(|f| f.to_string());
                    return;
                }
            }
        }
    }

    fn should_restart(&self) -> bool {
        match self.request.spec.restart_policy {
            RestartPolicy::Never => false,
            RestartPolicy::OnFailure { max_restarts } => {
                !self.stop.is_cancelled() && self.status.restarts < max_restarts
            }
        }
    }

    async fn relaunch(&mut self) -> Result<WorkerEvents, SubmitError> {
        let job_id = self.job_id().clone();
        let resume_from = self.checkpoints.resolve_resume(&job_id).await?;
        warn!(
            restarts = self.status.restarts + 1,
            resume_step = resume_from.as_ref().map(|r| r.step),
            last_error = self.status.last_error.as_deref().unwrap_or(""),
            "Restarting failed job"
        );
        self.request.resume_from = resume_from;
        self.request.attempt += 1;
        self.status.begin_restart();
        self.publish.send_replace(self.status.clone());
        Ok(self.cluster.launch(self.request.clone()).await?)
    }

    async fn record_resume_point(&mut self) {
        let job_id = self.job_id().clone();
        let latest = match self.checkpoints.latest_committed(&job_id).await {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                info!("No committed checkpoint to resume from");
                return;
            }
            Err(err) => {
                warn!(error = %err, "Couldn't look up latest checkpoint");
                return;
            }
        };
        match self.checkpoints.record_resume_point(&job_id, &latest).await {
            Ok(point) => {
                info!(step = point.step, "Recorded resume point");
                self.status.resume_step = Some(point.step);
            }
            Err(err) => warn!(error = %err, "Couldn't record resume point"),
        }
    }

    async fn retain_checkpoints(&mut self) {
        let job_id = self.job_id().clone();
        match self.checkpoints.latest_committed(&job_id).await {
            Ok(Some(latest)) => match self.checkpoints.gc(&job_id, latest.step).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(?removed, "Removed old checkpoints")
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "Checkpoint retention failed"),
            },
            Ok(None) => {}
            Err(err) => warn!(error = %err, "Couldn't look up latest checkpoint"),
        }
        match self.checkpoints.sweep_abandoned(&job_id, Utc::now()).await {
            Ok(swept) if !swept.is_empty() => info!(?swept, "Swept abandoned checkpoints"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Liveness sweep failed"),
        }
    }
}
