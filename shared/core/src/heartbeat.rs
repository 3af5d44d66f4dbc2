use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Rank;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Running,
    Stalled,
    Failed,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Running => write!(f, "running"),
            HealthStatus::Stalled => write!(f, "stalled"),
            HealthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Liveness report emitted by one worker. Only the coordinator reads these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub rank: Rank,
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
}

impl WorkerHeartbeat {
    pub fn now(rank: Rank, step: u64, status: HealthStatus) -> Self {
        Self {
            rank,
            step,
            timestamp: Utc::now(),
            status,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TargetReached,
    StopRequested,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutcome {
    pub rank: Rank,
    pub final_step: u64,
    /// Checkpoint commits this worker took part in that were finalized.
    pub commits: u64,
    /// Step of the commit made on the way out, if any.
    pub exit_commit: Option<u64>,
    pub exit: ExitReason,
}

/// Everything a worker tells the coordinator. Process-backed workers print
/// one of these per line as JSON on stdout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Heartbeat(WorkerHeartbeat),
    Exited {
        rank: Rank,
        result: Result<WorkerOutcome, String>,
    },
}

impl WorkerEvent {
    pub fn rank(&self) -> Rank {
        match self {
            WorkerEvent::Heartbeat(heartbeat) => heartbeat.rank,
            WorkerEvent::Exited { rank, .. } => *rank,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = WorkerEvent::Heartbeat(WorkerHeartbeat::now(Rank(2), 17, HealthStatus::Running));
        let line = serde_json::to_string(&event).unwrap();
        assert!(line.contains("\"event\":\"heartbeat\""));
        assert!(line.contains("\"status\":\"running\""));
        assert_eq!(serde_json::from_str::<WorkerEvent>(&line).unwrap(), event);
    }

    #[test]
    fn test_exit_event_json() {
        let event = WorkerEvent::Exited {
            rank: Rank(1),
            result: Err("checksum mismatch".to_string()),
        };
        let line = serde_json::to_string(&event).unwrap();
        let parsed: WorkerEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.rank(), Rank(1));
        assert_eq!(parsed, event);
    }
}
