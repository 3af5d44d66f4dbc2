mod checksum;
mod heartbeat;
mod identity;
mod interval;
mod retry;
mod running_average;
mod topology;

pub use checksum::{Checksum, ChecksumParseError, sha256};
pub use heartbeat::{ExitReason, HealthStatus, WorkerEvent, WorkerHeartbeat, WorkerOutcome};
pub use identity::{InvalidJobId, JobId, Rank};
pub use interval::IndexRange;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use running_average::RunningAverage;
pub use topology::{AcceleratorKind, ParseAcceleratorError, Topology, TopologyError, WorkerSlot};
