//! Job lifecycle for sharded finetuning runs.
//!
//! A [`JobCoordinator`] validates a [`JobSpec`], plans its sharding, launches
//! one worker per rank on a [`ClusterBackend`] and folds the workers'
//! heartbeats and exits into a [`JobStatus`].

mod cluster;
mod config;
mod coordinator;
mod local;
mod process;
mod spec;
mod state;

pub use cluster::{ClusterBackend, ClusterError, LaunchRequest, WorkerEvents};
pub use config::{
    ConfigError, ENV_KEYS, ENV_PREFIX, JobConfig, ResumeMode, TPU_LOCKFILE, TrainingMode,
};
pub use coordinator::{DEFAULT_POLL_INTERVAL, JobCoordinator, SubmitError};
pub use local::{LocalCluster, SyntheticWorkerFactory, WorkerFactory, WorkerWiring};
pub use process::ProcessCluster;
pub use spec::{InvalidJobSpec, JobSpec, Resources, RestartPolicy};
pub use state::{FailureReason, JobEvent, JobState, JobStatus, WorkerExit, WorkerStatus};
