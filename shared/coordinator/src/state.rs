use chrono::{DateTime, Utc};
use kestrel_core::{ExitReason, HealthStatus, JobId, Rank, WorkerHeartbeat, WorkerOutcome};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("StartupTimeout: not every worker reported within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("StallTimeout: rank {rank} made no progress within {timeout:?}")]
    StallTimeout { rank: Rank, timeout: Duration },

    #[error("rank {rank} failed: {error}")]
    WorkerFailed { rank: Rank, error: String },

    #[error("lost contact with workers: {0}")]
    Lost(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// Every worker reported its first heartbeat.
    AllStarted,
    Failed(FailureReason),
    /// Every worker exited successfully. `stopped` when they exited because
    /// of a stop request.
    AllExited { stopped: bool },
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Stopped)
    }

    /// Next state after `event`. Terminal states absorb everything, and
    /// events that make no sense in the current state leave it unchanged.
    pub fn apply(self, event: &JobEvent) -> JobState {
        use JobState::*;
        match (self, event) {
            (state, _) if state.is_terminal() => state,
            (Submitted, JobEvent::AllStarted) => Running,
            (Submitted | Running, JobEvent::Failed(_)) => Failed,
            (Running, JobEvent::AllExited { stopped: false }) => Completed,
            (Running, JobEvent::AllExited { stopped: true }) => Stopped,
            (state, event) => {
                debug!(state = %state, ?event, "Ignoring job event");
                state
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerExit {
    Succeeded {
        exit: ExitReason,
        final_step: u64,
        commits: u64,
        exit_commit: Option<u64>,
    },
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub rank: Rank,
    pub step: u64,
    pub health: Option<HealthStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub exit: Option<WorkerExit>,
}

impl WorkerStatus {
    fn new(rank: Rank) -> Self {
        Self {
            rank,
            step: 0,
            health: None,
            last_heartbeat: None,
            exit: None,
        }
    }
}

/// Outward view of one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    /// Human-readable cause when `state` is `Failed`.
    pub last_error: Option<String>,
    pub failure: Option<FailureReason>,
    /// Step the next submission of this job will resume from.
    pub resume_step: Option<u64>,
    pub restarts: u32,
    pub workers: Vec<WorkerStatus>,
}

impl JobStatus {
    pub fn new(job_id: JobId, world_size: u32) -> Self {
        Self {
            job_id,
            state: JobState::Submitted,
            last_error: None,
            failure: None,
            resume_step: None,
            restarts: 0,
            workers: (0..world_size).map(|r| WorkerStatus::new(Rank(r))).collect(),
        }
    }

    /// Applies `event` and returns whether the state changed.
    pub fn apply(&mut self, event: JobEvent) -> bool {
        let next = self.state.apply(&event);
        if next == self.state {
            return false;
        }
        if let JobEvent::Failed(reason) = event {
            self.last_error = Some(reason.to_string());
            self.failure = Some(reason);
        }
        self.state = next;
        true
    }

    pub fn record_heartbeat(&mut self, heartbeat: &WorkerHeartbeat) {
        if let Some(worker) = self.workers.get_mut(heartbeat.rank.index()) {
            worker.step = worker.step.max(heartbeat.step);
            worker.health = Some(heartbeat.status);
            worker.last_heartbeat = Some(heartbeat.timestamp);
        }
    }

    /// Records a worker's exit. Returns the error that fails the job, if any.
    /// A stopped worker without a final checkpoint counts as failed.
    pub fn record_exit(
        &mut self,
        rank: Rank,
        result: &Result<WorkerOutcome, String>,
    ) -> Result<(), String> {
        let exit = match result {
            Ok(outcome) if outcome.exit == ExitReason::StopRequested && outcome.exit_commit.is_none() => {
                WorkerExit::Failed(format!(
                    "stopped at step {} without committing a final checkpoint",
                    outcome.final_step
                ))
            }
            Ok(outcome) => WorkerExit::Succeeded {
                exit: outcome.exit,
                final_step: outcome.final_step,
                commits: outcome.commits,
                exit_commit: outcome.exit_commit,
            },
            Err(error) => WorkerExit::Failed(error.clone()),
        };
        let failure = match &exit {
            WorkerExit::Failed(error) => Err(error.clone()),
            WorkerExit::Succeeded { .. } => Ok(()),
        };
        if let Some(worker) = self.workers.get_mut(rank.index()) {
            if let Ok(outcome) = result {
                worker.step = worker.step.max(outcome.final_step);
            }
            worker.exit = Some(exit);
        }
        failure
    }

    pub fn all_started(&self) -> bool {
        self.workers.iter().all(|w| w.health.is_some())
    }

    /// `Some(stopped)` once every worker exited successfully. A worker that
    /// stopped only counts once its final checkpoint is committed.
    pub fn all_succeeded(&self) -> Option<bool> {
        let mut stopped = false;
        for worker in &self.workers {
            match &worker.exit {
                Some(WorkerExit::Succeeded {
                    exit: ExitReason::StopRequested,
                    exit_commit: Some(_),
                    ..
                }) => stopped = true,
                Some(WorkerExit::Succeeded {
                    exit: ExitReason::TargetReached,
                    ..
                }) => {}
                _ => return None,
            }
        }
        Some(stopped)
    }

    /// Resets the per-attempt fields for a resubmission.
    pub(crate) fn begin_restart(&mut self) {
        self.state = JobState::Submitted;
        self.restarts += 1;
        self.failure = None;
        self.last_error = None;
        for worker in &mut self.workers {
            *worker = WorkerStatus::new(worker.rank);
        }
    }
}
