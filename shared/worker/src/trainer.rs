use anyhow::{Result, ensure};
use kestrel_sharding::{ShardAssignment, TensorPartition};
use std::path::Path;

use crate::{Batch, ShardState};

/// Local result of one forward/backward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct StepOutput {
    /// This rank's share of the gradient summary. Every rank must produce the
    /// same length; the vectors are summed across ranks.
    pub contribution: Vec<f32>,
    pub loss: f32,
}

/// Accelerator-side math for the shards one rank owns.
pub trait ShardTrainer: Send + Sync {
    /// Initial state of `shard` from the base model files in `model_dir`.
    fn load_shard(
        &self,
        model_dir: &Path,
        tensor: &TensorPartition,
        shard: &ShardAssignment,
    ) -> Result<ShardState>;

    /// Forward and backward pass over `batch` using every owned shard,
    /// frozen ones included.
    fn forward_backward(&self, shards: &[ShardState], batch: &Batch) -> Result<StepOutput>;

    /// Optimizer update of one trainable shard from the all-reduced
    /// contribution.
    fn apply_update(&self, shard: &mut ShardState, reduced: &[f32], world_size: u32) -> Result<()>;
}

/// Deterministic stand-in for real model math. Equal inputs always produce
/// bit-identical outputs.
#[derive(Clone, Debug)]
pub struct DummyTrainer {
    pub contribution_len: usize,
    pub learning_rate: f32,
    pub momentum: f32,
}

impl Default for DummyTrainer {
    fn default() -> Self {
        Self {
            contribution_len: 8,
            learning_rate: 0.01,
            momentum: 0.9,
        }
    }
}

fn seed(name: &str) -> u64 {
    // FNV-1a
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

fn init_value(seed: u64, index: u64) -> f32 {
    let mixed = seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ((mixed >> 40) % 2001) as f32 / 1000.0 - 1.0
}

impl ShardTrainer for DummyTrainer {
    fn load_shard(
        &self,
        model_dir: &Path,
        tensor: &TensorPartition,
        shard: &ShardAssignment,
    ) -> Result<ShardState> {
        ensure!(
            model_dir.is_dir(),
            "base model directory {} is missing",
            model_dir.display()
        );
        let numel = tensor.shard_numel(shard);
        let seed = seed(&tensor.name);
        let offset = shard.id.index as u64 * numel;
        let values = (0..numel).map(|i| init_value(seed, offset + i)).collect();
        Ok(ShardState::new(shard.id.clone(), values))
    }

    fn forward_backward(&self, shards: &[ShardState], batch: &Batch) -> Result<StepOutput> {
        let signal = batch
            .tokens
            .iter()
            .fold(0u64, |acc, &t| acc.wrapping_mul(31).wrapping_add(t as u64));
        let state: f32 = shards.iter().map(ShardState::mean).sum();
        let contribution = (0..self.contribution_len)
            .map(|j| {
                let token_term = ((signal >> (j % 48)) % 1000) as f32 / 1000.0;
                (token_term - 0.5) * 0.1 + state * 0.01
            })
            .collect::<Vec<_>>();
        let loss = contribution.iter().map(|c| c * c).sum::<f32>() + state.abs();
        Ok(StepOutput { contribution, loss })
    }

    fn apply_update(&self, shard: &mut ShardState, reduced: &[f32], world_size: u32) -> Result<()> {
        ensure!(
            reduced.len() == self.contribution_len,
            "expected {} reduced values, got {}",
            self.contribution_len,
            reduced.len()
        );
        let scale = 1.0 / world_size.max(1) as f32;
        for (i, (value, moment)) in shard
            .values
            .iter_mut()
            .zip(shard.optimizer.iter_mut())
            .enumerate()
        {
            let grad = reduced[i % reduced.len()] * scale;
            *moment = self.momentum * *moment + grad;
            *value -= self.learning_rate * *moment;
        }
        shard.step += 1;
        Ok(())
    }
}
