use kestrel_core::{Checksum, IndexRange, Rank};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fmt};

use crate::PartitionViolation;

/// Identity of one shard: the tensor it belongs to and its position along the
/// slicing axis.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub tensor: String,
    pub index: u32,
}

impl ShardId {
    pub fn new(tensor: impl Into<String>, index: u32) -> Self {
        Self {
            tensor: tensor.into(),
            index,
        }
    }

    /// Path-safe key used for object names.
    pub fn key(&self) -> String {
        format!("{}--{:05}", self.tensor, self.index)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tensor, self.index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub id: ShardId,
    pub rank: Rank,
    /// Slice of the tensor along the partition axis. For unsplit tensors this
    /// spans the whole outer dimension.
    pub range: IndexRange,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorPartition {
    pub name: String,
    pub shape: Vec<u64>,
    pub trainable: bool,
    /// `None` when the tensor is held whole by a single rank.
    pub axis: Option<usize>,
    pub shards: Vec<ShardAssignment>,
}

impl TensorPartition {
    fn extent(&self) -> u64 {
        match self.axis {
            Some(axis) => self.shape[axis],
            None => self.shape.first().copied().unwrap_or(1),
        }
    }

    /// Shape of one shard of this tensor.
    pub fn shard_shape(&self, shard: &ShardAssignment) -> Vec<u64> {
        let mut shape = self.shape.clone();
        if let Some(axis) = self.axis {
            shape[axis] = shard.range.len();
        }
        shape
    }

    pub fn shard_numel(&self, shard: &ShardAssignment) -> u64 {
        self.shard_shape(shard).iter().product()
    }

    pub fn owners(&self) -> impl Iterator<Item = Rank> + '_ {
        self.shards.iter().map(|s| s.rank)
    }

    fn verify(&self, world_size: u32) -> Result<(), PartitionViolation> {
        let tensor = || self.name.clone();
        if self.shards.is_empty() {
            return Err(PartitionViolation::NoShards { tensor: tensor() });
        }
        if let Some(shard) = self.shards.iter().find(|s| s.rank.0 >= world_size) {
            return Err(PartitionViolation::UnknownRank {
                tensor: tensor(),
                rank: shard.rank,
            });
        }
        let mut ranges: Vec<IndexRange> = self.shards.iter().map(|s| s.range).collect();
        ranges.sort();
        let mut cursor = 0;
        for range in ranges {
            if range.start > cursor {
                return Err(PartitionViolation::Gap {
                    tensor: tensor(),
                    at: cursor,
                });
            }
            if range.start < cursor {
                return Err(PartitionViolation::Overlap {
                    tensor: tensor(),
                    at: range.start,
                });
            }
            cursor = range.end;
        }
        let expected = self.extent();
        if cursor != expected {
            return Err(PartitionViolation::WrongEnd {
                tensor: tensor(),
                end: cursor,
                expected,
            });
        }
        Ok(())
    }
}

/// Assignment of every parameter shard to exactly one rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    world_size: u32,
    tensors: Vec<TensorPartition>,
}

impl PartitionPlan {
    pub(crate) fn new(world_size: u32, tensors: Vec<TensorPartition>) -> Self {
        Self {
            world_size,
            tensors,
        }
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn tensors(&self) -> &[TensorPartition] {
        &self.tensors
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorPartition> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn shard(&self, id: &ShardId) -> Option<(&TensorPartition, &ShardAssignment)> {
        let tensor = self.tensor(&id.tensor)?;
        let shard = tensor.shards.iter().find(|s| s.id == *id)?;
        Some((tensor, shard))
    }

    /// Shards owned by `rank`, in model order.
    pub fn shards_for_rank(&self, rank: Rank) -> Vec<(&TensorPartition, &ShardAssignment)> {
        self.tensors
            .iter()
            .flat_map(|t| {
                t.shards
                    .iter()
                    .filter(move |s| s.rank == rank)
                    .map(move |s| (t, s))
            })
            .collect()
    }

    /// Elements owned by each rank, indexed by rank.
    pub fn rank_loads(&self) -> Vec<u64> {
        let mut loads = vec![0u64; self.world_size as usize];
        for tensor in &self.tensors {
            for shard in &tensor.shards {
                loads[shard.rank.index()] += tensor.shard_numel(shard);
            }
        }
        loads
    }

    /// Shards a checkpoint of this plan must contain: every shard of every
    /// trainable tensor.
    pub fn checkpoint_manifest(&self) -> BTreeSet<ShardId> {
        self.tensors
            .iter()
            .filter(|t| t.trainable)
            .flat_map(|t| t.shards.iter().map(|s| s.id.clone()))
            .collect()
    }

    /// Stable digest of the plan layout.
    pub fn fingerprint(&self) -> Checksum {
        let mut hasher = Sha256::new();
        hasher.update(self.world_size.to_le_bytes());
        for tensor in &self.tensors {
            hasher.update((tensor.name.len() as u64).to_le_bytes());
            hasher.update(tensor.name.as_bytes());
            hasher.update((tensor.shape.len() as u64).to_le_bytes());
            for dim in &tensor.shape {
                hasher.update(dim.to_le_bytes());
            }
            hasher.update([tensor.trainable as u8]);
            hasher.update(tensor.axis.map_or(u64::MAX, |a| a as u64).to_le_bytes());
            for shard in &tensor.shards {
                hasher.update(shard.id.index.to_le_bytes());
                hasher.update(shard.rank.0.to_le_bytes());
                hasher.update(shard.range.start.to_le_bytes());
                hasher.update(shard.range.end.to_le_bytes());
            }
        }
        let digest: [u8; 32] = hasher.finalize().into();
        Checksum::from(digest)
    }

    /// Checks that every tensor's shards cover it exactly once.
    pub fn verify_exact_partition(&self) -> Result<(), PartitionViolation> {
        self.tensors
            .iter()
            .try_for_each(|t| t.verify(self.world_size))
    }
}
