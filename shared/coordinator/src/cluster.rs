use async_trait::async_trait;
use kestrel_checkpoint::{CheckpointRecord, CheckpointStore};
use kestrel_core::{JobId, Rank, Topology, TopologyError, WorkerEvent};
use kestrel_sharding::ModelShapes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{JobConfig, JobSpec};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("cluster topology is invalid: {0}")]
    Topology(#[from] TopologyError),

    #[error("couldn't launch rank {rank}: {source}")]
    Launch {
        rank: Rank,
        #[source]
        source: std::io::Error,
    },

    #[error("job {0} is already running on this cluster")]
    AlreadyRunning(JobId),

    #[error("no job {0} on this cluster")]
    UnknownJob(JobId),

    #[error("cluster I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to start one attempt of a job.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    pub spec: Arc<JobSpec>,
    pub config: Arc<JobConfig>,
    pub topology: Arc<Topology>,
    /// Model the workers train, adapter tensors included.
    pub model: Arc<ModelShapes>,
    pub resume_from: Option<CheckpointRecord>,
    /// Store the job's checkpoints are written to.
    pub checkpoints: CheckpointStore,
    /// 0 for the first launch, incremented per restart.
    pub attempt: u32,
}

/// Merged event stream of every worker of one launch. Closes when every
/// worker is gone.
pub type WorkerEvents = UnboundedReceiver<WorkerEvent>;

/// Where workers run.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Workers this cluster would give `spec`.
    async fn topology(&self, spec: &JobSpec) -> Result<Topology, ClusterError>;

    async fn launch(&self, request: LaunchRequest) -> Result<WorkerEvents, ClusterError>;

    /// Delivers the cooperative stop signal to every worker of `job`.
    async fn request_stop(&self, job_id: &JobId) -> Result<(), ClusterError>;

    /// Kills every worker of `job` without waiting for them.
    async fn terminate(&self, job_id: &JobId) -> Result<(), ClusterError>;
}
