//! Deterministic partitioning of model parameters and training data across
//! the ranks of a job's topology.
//!
//! [`plan`] is a pure function: the same model shapes and topology always
//! produce the same [`PartitionPlan`], which is what makes resuming from a
//! checkpoint reproducible. Plans carry a [`PartitionPlan::fingerprint`] that
//! checkpoint records store so a resume against a different layout is refused.

mod data;
mod errors;
mod plan;
mod planner;
mod shapes;

pub use data::{DataPartition, DataSharding, plan_data};
pub use errors::{Infeasibility, PartitionViolation, PlanError};
pub use plan::{PartitionPlan, ShardAssignment, ShardId, TensorPartition};
pub use planner::plan;
pub use shapes::{ModelShapes, TensorSpec};
