use kestrel_core::Rank;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("infeasible topology: {0}")]
    InfeasibleTopology(#[from] Infeasibility),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("planner produced an inexact partition: {0}")]
    Inexact(#[from] PartitionViolation),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Infeasibility {
    #[error("tensor {tensor} requests {shards} shards but only {world_size} ranks exist")]
    TooManyShards {
        tensor: String,
        shards: u32,
        world_size: u32,
    },

    #[error("no axis of tensor {tensor} {shape:?} is divisible into {shards} shards{}", pinned_suffix(.axis))]
    NotDivisible {
        tensor: String,
        shape: Vec<u64>,
        shards: u32,
        axis: Option<usize>,
    },

    #[error("rank {rank} would own no shard")]
    IdleRank { rank: Rank },

    #[error("{examples} examples cannot be split across {world_size} ranks")]
    TooFewExamples { examples: u64, world_size: u32 },
}

fn pinned_suffix(axis: &Option<usize>) -> String {
    match axis {
        Some(axis) => format!(" along pinned axis {axis}"),
        None => String::new(),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartitionViolation {
    #[error("tensor {tensor} has no shards")]
    NoShards { tensor: String },

    #[error("tensor {tensor}: shards leave a gap before index {at}")]
    Gap { tensor: String, at: u64 },

    #[error("tensor {tensor}: shards overlap at index {at}")]
    Overlap { tensor: String, at: u64 },

    #[error("tensor {tensor}: shards end at {end}, expected {expected}")]
    WrongEnd {
        tensor: String,
        end: u64,
        expected: u64,
    },

    #[error("tensor {tensor}: shard assigned to rank {rank} outside the topology")]
    UnknownRank { tensor: String, rank: Rank },
}
