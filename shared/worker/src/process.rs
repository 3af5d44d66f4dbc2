use kestrel_checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore};
use kestrel_core::{InvalidJobId, JobId, Rank, WorkerEvent, WorkerOutcome};
use kestrel_logging::{LogOutput, LogStream, LoggingBuilder, logging};
use std::{collections::HashMap, path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{WorkerContext, WorkerError, WorkerRuntime};

pub const ENV_JOB_ID: &str = "KESTREL_JOB_ID";
pub const ENV_RANK: &str = "KESTREL_RANK";
pub const ENV_WORLD_SIZE: &str = "KESTREL_WORLD_SIZE";
pub const ENV_STOP_FILE: &str = "KESTREL_STOP_FILE";
pub const ENV_RESUME_STEP: &str = "KESTREL_RESUME_STEP";

/// How often a process worker looks for its stop file.
pub const STOP_FILE_POLL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum WorkerEnvError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },

    #[error(transparent)]
    JobId(#[from] InvalidJobId),

    #[error("rank {rank} is outside a world of {world_size}")]
    RankOutOfRange { rank: u32, world_size: u32 },

    #[error("launched into a world of {env} workers, topology has {topology}")]
    WorldSizeMismatch { env: u32, topology: u32 },
}

/// Identity a process-backed worker receives from its launcher.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerEnv {
    pub job_id: JobId,
    pub rank: Rank,
    pub world_size: u32,
    pub stop_file: Option<PathBuf>,
    pub resume_step: Option<u64>,
}

impl WorkerEnv {
    pub fn from_env() -> Result<Self, WorkerEnvError> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, WorkerEnvError> {
        let get = |key: &'static str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let parse = |key: &'static str| -> Result<Option<u64>, WorkerEnvError> {
            get(key)
                .map(|value| {
                    value.parse().map_err(|_| WorkerEnvError::Invalid {
                        key,
                        value: value.to_string(),
                    })
                })
                .transpose()
        };

        let job_id = JobId::new(get(ENV_JOB_ID).ok_or(WorkerEnvError::Missing(ENV_JOB_ID))?)?;
        let rank = parse(ENV_RANK)?.ok_or(WorkerEnvError::Missing(ENV_RANK))?;
        let world_size = parse(ENV_WORLD_SIZE)?.ok_or(WorkerEnvError::Missing(ENV_WORLD_SIZE))?;
        let (rank, world_size) = match (u32::try_from(rank), u32::try_from(world_size)) {
            (Ok(rank), Ok(world_size)) if rank < world_size => (rank, world_size),
            _ => {
                return Err(WorkerEnvError::RankOutOfRange {
                    rank: rank.min(u32::MAX as u64) as u32,
                    world_size: world_size.min(u32::MAX as u64) as u32,
                });
            }
        };

        Ok(Self {
            job_id,
            rank: Rank(rank),
            world_size,
            stop_file: get(ENV_STOP_FILE).map(PathBuf::from),
            resume_step: parse(ENV_RESUME_STEP)?,
        })
    }

    /// Variables a launcher sets so that [`WorkerEnv::from_env`] yields `self`.
    pub fn to_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_JOB_ID, self.job_id.to_string()),
            (ENV_RANK, self.rank.to_string()),
            (ENV_WORLD_SIZE, self.world_size.to_string()),
        ];
        if let Some(stop_file) = &self.stop_file {
            vars.push((ENV_STOP_FILE, stop_file.display().to_string()));
        }
        if let Some(step) = self.resume_step {
            vars.push((ENV_RESUME_STEP, step.to_string()));
        }
        vars
    }
}

/// Writes every event as one JSON line until the channel closes.
pub async fn forward_events<W>(
    mut events: UnboundedReceiver<WorkerEvent>,
    mut out: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}

/// Logging of a worker process: JSON on stderr, leaving stdout to the event
/// stream.
pub fn worker_logging() -> LoggingBuilder {
    logging()
        .with_output(LogOutput::Json)
        .with_stream(LogStream::Stderr)
}

/// Channel and stop token a process worker's context is built around.
pub struct ProcessWiring {
    pub events: UnboundedSender<WorkerEvent>,
    pub stop: CancellationToken,
}

/// Runs the rank `env` names inside a launched worker process.
///
/// The context comes from `build`, with identity taken from `env`. Training
/// resumes from the announced step, stops gracefully once the stop file
/// appears, and every event is written to `out` as a JSON line (stdout, for
/// a `ProcessCluster` child).
pub async fn run_process_worker<W>(
    env: &WorkerEnv,
    build: impl FnOnce(ProcessWiring) -> WorkerContext,
    out: W,
) -> Result<WorkerOutcome, WorkerError>
where
    W: AsyncWrite + Unpin,
{
    let (events, rx) = unbounded_channel();
    let stop = CancellationToken::new();
    let mut ctx = build(ProcessWiring {
        events,
        stop: stop.clone(),
    });
    ctx.job_id = env.job_id.clone();
    ctx.rank = env.rank;
    let topology = ctx.topology.world_size();
    if topology != env.world_size {
        return Err(WorkerEnvError::WorldSizeMismatch {
            env: env.world_size,
            topology,
        }
        .into());
    }
    let resume_from = match env.resume_step {
        Some(step) => Some(committed_record(&ctx.checkpoints, &env.job_id, step).await?),
        None => None,
    };

    let watcher = env
        .stop_file
        .clone()
        .map(|path| watch_stop_file(path, STOP_FILE_POLL, stop.clone()));
    // the runtime owns the only sender, so forwarding ends once it returns
    let (result, forwarded) = tokio::join!(
        WorkerRuntime::new(ctx).run(resume_from),
        forward_events(rx, out)
    );
    stop.cancel();
    if let Some(watcher) = watcher {
        if let Err(err) = watcher.await {
            warn!(error = %err, "Stop file watcher failed");
        }
    }
    if let Err(err) = forwarded {
        warn!(error = %err, "Couldn't forward worker events");
    }
    result
}

/// [`run_process_worker`] for a process started by a launcher: identity from
/// `KESTREL_*` variables, events on stdout.
pub async fn run_process_worker_from_env(
    build: impl FnOnce(ProcessWiring) -> WorkerContext,
) -> Result<WorkerOutcome, WorkerError> {
    let env = WorkerEnv::from_env()?;
    run_process_worker(&env, build, tokio::io::stdout()).await
}

async fn committed_record(
    checkpoints: &CheckpointStore,
    job_id: &JobId,
    step: u64,
) -> Result<CheckpointRecord, CheckpointError> {
    let record = checkpoints
        .record(job_id, step)
        .await?
        .ok_or_else(|| CheckpointError::NotFound {
            job_id: job_id.clone(),
            step,
        })?;
    if !record.is_committed() {
        return Err(CheckpointError::NotCommitted { step });
    }
    Ok(record)
}

/// Cancels `stop` once `path` exists. The task ends when the token is
/// cancelled by anyone.
pub fn watch_stop_file(path: PathBuf, poll: Duration, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => {}
            }
            match tokio::fs::try_exists(&path).await {
                Ok(true) => {
                    info!(path = %path.display(), "Stop file found, requesting graceful stop");
                    stop.cancel();
                    return;
                }
                Ok(false) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Couldn't check stop file"),
            }
        }
    })
}
