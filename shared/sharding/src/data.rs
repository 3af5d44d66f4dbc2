use kestrel_core::{IndexRange, Rank, Topology};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::{Infeasibility, PlanError};

/// How training examples are distributed over ranks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSharding {
    /// The dataset is split into one contiguous block per host.
    PerHost,
    /// Every host sees the whole dataset and takes a rank-strided subset of
    /// each global batch.
    #[default]
    Replicated,
}

impl FromStr for DataSharding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-host" => Ok(Self::PerHost),
            "replicated" => Ok(Self::Replicated),
            other => Err(format!(
                "unknown data sharding {other:?}, expected per-host or replicated"
            )),
        }
    }
}

impl fmt::Display for DataSharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerHost => write!(f, "per-host"),
            Self::Replicated => write!(f, "replicated"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPartition {
    pub mode: DataSharding,
    pub num_examples: u64,
    /// Examples each rank may read, indexed by rank.
    pub ranges: Vec<IndexRange>,
}

impl DataPartition {
    pub fn range_for(&self, rank: Rank) -> Option<IndexRange> {
        self.ranges.get(rank.index()).copied()
    }

    /// Dataset indices of the `batch_size` examples `rank` trains on at
    /// `step`. Deterministic, so a resumed job replays the same stream.
    pub fn batch_indices(&self, rank: Rank, step: u64, batch_size: u64) -> Vec<u64> {
        let world_size = self.ranges.len() as u64;
        match self.mode {
            DataSharding::PerHost => {
                let Some(range) = self.range_for(rank) else {
                    return vec![];
                };
                (0..batch_size)
                    .map(|j| range.start + (step * batch_size + j) % range.len())
                    .collect()
            }
            DataSharding::Replicated => (0..batch_size)
                .map(|j| ((step * world_size + rank.0 as u64) * batch_size + j) % self.num_examples)
                .collect(),
        }
    }
}

/// Splits `num_examples` training examples across the ranks of `topology`.
pub fn plan_data(
    num_examples: u64,
    topology: &Topology,
    mode: DataSharding,
) -> Result<DataPartition, PlanError> {
    let world_size = topology.world_size();
    if num_examples == 0
        || (mode == DataSharding::PerHost && num_examples < world_size as u64)
    {
        return Err(Infeasibility::TooFewExamples {
            examples: num_examples,
            world_size,
        }
        .into());
    }

    let ranges = match mode {
        DataSharding::Replicated => vec![IndexRange::new(0, num_examples); world_size as usize],
        DataSharding::PerHost => {
            let base = num_examples / world_size as u64;
            let remainder = num_examples % world_size as u64;
            let mut start = 0;
            topology
                .ranks()
                .map(|rank| {
                    let len = base + u64::from((rank.0 as u64) < remainder);
                    let range = IndexRange::new(start, start + len);
                    start += len;
                    range
                })
                .collect()
        }
    };

    Ok(DataPartition {
        mode,
        num_examples,
        ranges,
    })
}
