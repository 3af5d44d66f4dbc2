use kestrel_core::{IndexRange, Rank, Topology};
use tracing::debug;

use crate::{
    Infeasibility, ModelShapes, PartitionPlan, PlanError, ShardAssignment, ShardId,
    TensorPartition, TensorSpec,
};

/// Computes the partition of `model` over `topology`.
///
/// Tensors are placed in model order. A tensor with shard count `k` is cut
/// into `k` equal slices along one axis, and the slices go to the `k` ranks
/// that own the fewest elements so far (lowest rank wins ties), in ascending
/// rank order.
pub fn plan(model: &ModelShapes, topology: &Topology) -> Result<PartitionPlan, PlanError> {
    model.validate()?;

    let world_size = topology.world_size();
    let mut loads = vec![0u64; world_size as usize];
    let mut tensors = Vec::with_capacity(model.tensors.len());

    for spec in &model.tensors {
        let shards = spec.shards.unwrap_or(world_size);
        if shards > world_size {
            return Err(Infeasibility::TooManyShards {
                tensor: spec.name.clone(),
                shards,
                world_size,
            }
            .into());
        }

        let partition = if shards == 1 {
            let rank = least_loaded(&loads, 1)[0];
            let extent = spec.shape.first().copied().unwrap_or(1);
            loads[rank.index()] += spec.numel();
            TensorPartition {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                trainable: spec.trainable,
                axis: None,
                shards: vec![ShardAssignment {
                    id: ShardId::new(&spec.name, 0),
                    rank,
                    range: IndexRange::new(0, extent),
                }],
            }
        } else {
            let axis = choose_axis(spec, shards)?;
            let slice = spec.shape[axis] / shards as u64;
            let shard_numel = spec.numel() / shards as u64;
            let owners = least_loaded(&loads, shards as usize);
            let assignments = owners
                .into_iter()
                .enumerate()
                .map(|(index, rank)| {
                    loads[rank.index()] += shard_numel;
                    let start = index as u64 * slice;
                    ShardAssignment {
                        id: ShardId::new(&spec.name, index as u32),
                        rank,
                        range: IndexRange::new(start, start + slice),
                    }
                })
                .collect();
            TensorPartition {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                trainable: spec.trainable,
                axis: Some(axis),
                shards: assignments,
            }
        };
        debug!(
            tensor = partition.name,
            axis = ?partition.axis,
            shards = partition.shards.len(),
            "Planned tensor"
        );
        tensors.push(partition);
    }

    if !tensors.is_empty() {
        if let Some(idle) = loads.iter().position(|load| *load == 0) {
            return Err(Infeasibility::IdleRank {
                rank: Rank(idle as u32),
            }
            .into());
        }
    }

    let plan = PartitionPlan::new(world_size, tensors);
    plan.verify_exact_partition()?;
    Ok(plan)
}

/// The `count` ranks with the smallest load, lowest rank first on ties,
/// returned in ascending rank order.
fn least_loaded(loads: &[u64], count: usize) -> Vec<Rank> {
    let mut order: Vec<usize> = (0..loads.len()).collect();
    order.sort_by_key(|&rank| (loads[rank], rank));
    let mut chosen: Vec<usize> = order.into_iter().take(count).collect();
    chosen.sort_unstable();
    chosen.into_iter().map(|r| Rank(r as u32)).collect()
}

/// Spread between the largest and smallest slice when `len` is cut into
/// `shards` contiguous pieces.
fn imbalance(len: u64, shards: u32) -> u64 {
    let shards = shards as u64;
    let largest = len.div_ceil(shards);
    let smallest = len / shards;
    largest - smallest
}

fn choose_axis(spec: &TensorSpec, shards: u32) -> Result<usize, PlanError> {
    let candidates: Vec<usize> = match spec.axis {
        Some(axis) => vec![axis],
        None => (0..spec.shape.len()).collect(),
    };
    candidates
        .into_iter()
        .filter(|&axis| spec.shape[axis] % shards as u64 == 0)
        // min_by_key keeps the first minimum, i.e. the outermost axis on ties
        .min_by_key(|&axis| imbalance(spec.shape[axis], shards))
        .ok_or_else(|| {
            Infeasibility::NotDivisible {
                tensor: spec.name.clone(),
                shape: spec.shape.clone(),
                shards,
                axis: spec.axis,
            }
            .into()
        })
}
