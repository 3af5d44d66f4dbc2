use anyhow::{Result, bail};
use async_trait::async_trait;
use kestrel_core::Rank;
use kestrel_sharding::DataPartition;
use std::time::Duration;

/// Examples one rank trains on in one step.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub step: u64,
    /// Dataset indices of the examples.
    pub indices: Vec<u64>,
    /// Token ids, `seq_len` per example.
    pub tokens: Vec<u32>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// The batch `rank` trains on at `step`. Must be a pure function of its
    /// arguments so a resumed job sees the same stream.
    async fn next_batch(&self, rank: Rank, step: u64) -> Result<Batch>;
}

/// Deterministic token stream over a [`DataPartition`], for tests and dry
/// runs.
#[derive(Clone, Debug)]
pub struct SyntheticData {
    partition: DataPartition,
    batch_size: u64,
    seq_len: usize,
    vocab_size: u32,
    delay: Duration,
}

impl SyntheticData {
    pub fn new(partition: DataPartition, batch_size: u64, seq_len: usize) -> Self {
        Self {
            partition,
            batch_size,
            seq_len,
            vocab_size: 32_000,
            delay: Duration::ZERO,
        }
    }

    /// Simulated loading latency per batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn token(&self, index: u64, position: usize) -> u32 {
        let mixed = index
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(position as u64)
            .rotate_left(17);
        (mixed % self.vocab_size as u64) as u32
    }
}

#[async_trait]
impl DataSource for SyntheticData {
    async fn next_batch(&self, rank: Rank, step: u64) -> Result<Batch> {
        if self.partition.range_for(rank).is_none() {
            bail!("rank {rank} has no data partition");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let indices = self.partition.batch_indices(rank, step, self.batch_size);
        let tokens = indices
            .iter()
            .flat_map(|&index| (0..self.seq_len).map(move |pos| (index, pos)))
            .map(|(index, pos)| self.token(index, pos))
            .collect();
        Ok(Batch {
            step,
            indices,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{AcceleratorKind, Topology};
    use kestrel_sharding::{DataSharding, plan_data};

    #[tokio::test]
    async fn test_synthetic_batches_are_deterministic() {
        let topology = Topology::uniform(2, "h", AcceleratorKind::Cpu, 1).unwrap();
        let partition = plan_data(64, &topology, DataSharding::PerHost).unwrap();
        let data = SyntheticData::new(partition, 4, 8);

        let a = data.next_batch(Rank(1), 5).await.unwrap();
        let b = data.next_batch(Rank(1), 5).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.tokens.len(), 32);
        assert!(a.indices.iter().all(|i| (32..64).contains(i)));
        assert_ne!(a, data.next_batch(Rank(1), 6).await.unwrap());
        assert!(data.next_batch(Rank(2), 0).await.is_err());
    }
}
