use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

use crate::Rank;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AcceleratorKind {
    /// TPU generation, e.g. `v5e`
    Tpu(String),
    /// GPU model, e.g. `h100`
    Gpu(String),
    Cpu,
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown accelerator {0:?}, expected tpu-<gen>, gpu-<model> or cpu")]
pub struct ParseAcceleratorError(pub String);

impl FromStr for AcceleratorKind {
    type Err = ParseAcceleratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if lower == "cpu" {
            return Ok(Self::Cpu);
        }
        match lower.split_once('-') {
            Some(("tpu", generation)) if !generation.is_empty() => {
                Ok(Self::Tpu(generation.to_string()))
            }
            Some(("gpu", model)) if !model.is_empty() => Ok(Self::Gpu(model.to_string())),
            _ => Err(ParseAcceleratorError(s.to_string())),
        }
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tpu(generation) => write!(f, "tpu-{generation}"),
            Self::Gpu(model) => write!(f, "gpu-{model}"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

impl TryFrom<String> for AcceleratorKind {
    type Error = ParseAcceleratorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AcceleratorKind> for String {
    fn from(value: AcceleratorKind) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub rank: Rank,
    pub host: String,
    pub accelerator: AcceleratorKind,
    pub accelerator_slots: u32,
}

#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("topology has no workers")]
    Empty,

    #[error("worker at position {position} has rank {found}, ranks must be 0..n in order")]
    RankOutOfOrder { position: usize, found: Rank },

    #[error("rank {0} has no accelerator slots")]
    NoSlots(Rank),
}

/// Ordered set of worker ranks available to one job.
///
/// Built once per job from cluster introspection and passed explicitly to
/// everything that needs it. There is no way to mutate a topology after
/// construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<WorkerSlot>", into = "Vec<WorkerSlot>")]
pub struct Topology {
    workers: Vec<WorkerSlot>,
}

impl Topology {
    pub fn new(workers: Vec<WorkerSlot>) -> Result<Self, TopologyError> {
        if workers.is_empty() {
            return Err(TopologyError::Empty);
        }
        for (position, slot) in workers.iter().enumerate() {
            if slot.rank.index() != position {
                return Err(TopologyError::RankOutOfOrder {
                    position,
                    found: slot.rank,
                });
            }
            if slot.accelerator_slots == 0 {
                return Err(TopologyError::NoSlots(slot.rank));
            }
        }
        Ok(Self { workers })
    }

    /// `world_size` identical workers, one per host named `{host_prefix}-{rank}`.
    pub fn uniform(
        world_size: u32,
        host_prefix: &str,
        accelerator: AcceleratorKind,
        accelerator_slots: u32,
    ) -> Result<Self, TopologyError> {
        Self::new(
            (0..world_size)
                .map(|rank| WorkerSlot {
                    rank: Rank(rank),
                    host: format!("{host_prefix}-{rank}"),
                    accelerator: accelerator.clone(),
                    accelerator_slots,
                })
                .collect(),
        )
    }

    pub fn world_size(&self) -> u32 {
        self.workers.len() as u32
    }

    pub fn ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        self.workers.iter().map(|w| w.rank)
    }

    pub fn slot(&self, rank: Rank) -> Option<&WorkerSlot> {
        self.workers.get(rank.index())
    }

    pub fn workers(&self) -> &[WorkerSlot] {
        &self.workers
    }

    /// The rank that drives checkpoint commits.
    pub fn leader(&self) -> Rank {
        self.workers[0].rank
    }

    pub fn total_accelerators(&self) -> u64 {
        self.workers
            .iter()
            .map(|w| w.accelerator_slots as u64)
            .sum()
    }
}

impl TryFrom<Vec<WorkerSlot>> for Topology {
    type Error = TopologyError;

    fn try_from(value: Vec<WorkerSlot>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topology> for Vec<WorkerSlot> {
    fn from(value: Topology) -> Self {
        value.workers
    }
}
