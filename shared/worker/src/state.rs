use kestrel_core::Checksum;
use kestrel_sharding::ShardId;
use serde::{Deserialize, Serialize};

/// Training state of one parameter shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard: ShardId,
    /// Number of optimizer steps applied to `values`.
    pub step: u64,
    pub values: Vec<f32>,
    /// Optimizer moment, one entry per value.
    pub optimizer: Vec<f32>,
}

impl ShardState {
    pub fn new(shard: ShardId, values: Vec<f32>) -> Self {
        let optimizer = vec![0.0; values.len()];
        Self {
            shard,
            step: 0,
            values,
            optimizer,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Digest of the encoded state; equal states give equal checksums.
    pub fn checksum(&self) -> Result<Checksum, postcard::Error> {
        Ok(Checksum::of(&self.encode()?))
    }

    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let mut state = ShardState::new(ShardId::new("w", 1), vec![0.5, -1.25, 3.0]);
        state.step = 42;
        state.optimizer[1] = 0.125;
        let decoded = ShardState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert_eq!(decoded.checksum().unwrap(), state.checksum().unwrap());
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let bytes = ShardState::new(ShardId::new("w", 0), vec![1.0; 8])
            .encode()
            .unwrap();
        assert!(ShardState::decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
