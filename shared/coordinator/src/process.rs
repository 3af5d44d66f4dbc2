use async_trait::async_trait;
use kestrel_core::{ExitReason, JobId, Rank, Topology, WorkerEvent, WorkerOutcome};
use kestrel_worker::process::WorkerEnv;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Mutex,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc::UnboundedSender,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ClusterBackend, ClusterError, JobSpec, LaunchRequest, WorkerEvents};

const STOP_FILE: &str = "STOP";

struct ProcessJob {
    stop_file: PathBuf,
    kill: CancellationToken,
}

/// Runs one `sh -c <command>` child process per rank on this host.
///
/// Workers learn their identity from `KESTREL_*` variables, print their
/// events as JSON lines on stdout and stop gracefully once the stop file
/// appears.
pub struct ProcessCluster {
    shell: String,
    state_dir: PathBuf,
    jobs: Mutex<HashMap<JobId, ProcessJob>>,
}

impl ProcessCluster {
    /// `state_dir` holds the per-job stop files.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: "sh".to_string(),
            state_dir: state_dir.into(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn stop_file(&self, job_id: &JobId) -> PathBuf {
        self.state_dir.join(job_id.as_str()).join(STOP_FILE)
    }

    fn spawn_rank(
        &self,
        request: &LaunchRequest,
        rank: Rank,
        stop_file: &Path,
    ) -> Result<Child, ClusterError> {
        let env = WorkerEnv {
            job_id: request.spec.job_id.clone(),
            rank,
            world_size: request.topology.world_size(),
            stop_file: Some(stop_file.to_owned()),
            resume_step: request.resume_from.as_ref().map(|record| record.step),
        };
        Command::new(&self.shell)
            .arg("-c")
            .arg(&request.spec.command)
            .envs(&request.spec.env)
            .envs(env.to_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClusterError::Launch { rank, source })
    }
}

/// Forwards the JSON events a child prints and turns its exit into an
/// `Exited` event when it did not report one itself.
async fn supervise(
    rank: Rank,
    mut child: Child,
    stop_file: PathBuf,
    events: UnboundedSender<WorkerEvent>,
    kill: CancellationToken,
) {
    let mut last_step = 0;
    let mut reported_exit = false;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = tokio::select! {
                _ = kill.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(event) if event.rank() == rank => {
                        match &event {
                            WorkerEvent::Heartbeat(heartbeat) => last_step = heartbeat.step,
                            WorkerEvent::Exited { .. } => reported_exit = true,
                        }
                        let _ = events.send(event);
                    }
                    Ok(event) => {
                        warn!(rank = %rank, claimed = %event.rank(), "Dropping event with wrong rank")
                    }
                    Err(_) => debug!(rank = %rank, "worker: {line}"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(rank = %rank, error = %err, "Couldn't read worker output");
                    break;
                }
            }
        }
    }

    let status = tokio::select! {
        _ = kill.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(rank = %rank, error = %err, "Couldn't kill worker");
            }
            return;
        }
        status = child.wait() => status,
    };
    if reported_exit {
        return;
    }
    let result = match status {
        Ok(status) if status.success() => {
            let exit = if stop_file.exists() {
                ExitReason::StopRequested
            } else {
                ExitReason::TargetReached
            };
            Ok(WorkerOutcome {
                rank,
                final_step: last_step,
                commits: 0,
                exit_commit: None,
                exit,
            })
        }
        Ok(status) => Err(format!("worker process exited with {status}")),
        Err(err) => Err(format!("couldn't wait for worker process: {err}")),
    };
    let _ = events.send(WorkerEvent::Exited { rank, result });
}

#[async_trait]
impl ClusterBackend for ProcessCluster {
    async fn topology(&self, spec: &JobSpec) -> Result<Topology, ClusterError> {
        Ok(Topology::uniform(
            spec.worker_count,
            "localhost",
            spec.resources.accelerator.clone(),
            spec.resources.accelerators_per_worker,
        )?)
    }

    async fn launch(&self, request: LaunchRequest) -> Result<WorkerEvents, ClusterError> {
        let job_id = request.spec.job_id.clone();
        if self.jobs.lock().unwrap().contains_key(&job_id) {
            return Err(ClusterError::AlreadyRunning(job_id));
        }

        let stop_file = self.stop_file(&job_id);
        if let Some(dir) = stop_file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        match tokio::fs::remove_file(&stop_file).await {
            Ok(()) => debug!(job_id = %job_id, "Removed stop file of an earlier attempt"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut children = Vec::new();
        for rank in request.topology.ranks() {
            match self.spawn_rank(&request, rank, &stop_file) {
                Ok(child) => children.push((rank, child)),
                // already spawned children are killed on drop
                Err(err) => return Err(err),
            }
        }

        let kill = CancellationToken::new();
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        for (rank, child) in children {
            tokio::spawn(supervise(
                rank,
                child,
                stop_file.clone(),
                events.clone(),
                kill.clone(),
            ));
        }
        info!(
            job_id = %job_id,
            world_size = request.topology.world_size(),
            command = %request.spec.command,
            "Launched worker processes"
        );
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id, ProcessJob { stop_file, kill });
        Ok(rx)
    }

    async fn request_stop(&self, job_id: &JobId) -> Result<(), ClusterError> {
        let stop_file = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .map(|job| job.stop_file.clone())
            .ok_or_else(|| ClusterError::UnknownJob(job_id.clone()))?;
        tokio::fs::write(&stop_file, b"").await?;
        info!(job_id = %job_id, path = %stop_file.display(), "Wrote stop file");
        Ok(())
    }

    async fn terminate(&self, job_id: &JobId) -> Result<(), ClusterError> {
        let job = self
            .jobs
            .lock()
            .unwrap()
            .remove(job_id)
            .ok_or_else(|| ClusterError::UnknownJob(job_id.clone()))?;
        job.kill.cancel();
        info!(job_id = %job_id, "Terminated worker processes");
        Ok(())
    }
}
