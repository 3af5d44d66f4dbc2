use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::PlanError;

/// Shape metadata for one parameter tensor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<u64>,
    /// Frozen tensors are loaded from the base model on every start and are
    /// never written to checkpoints.
    #[serde(default = "default_trainable")]
    pub trainable: bool,
    /// Number of shards to split this tensor into. Defaults to the world size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shards: Option<u32>,
    /// Pin the slicing axis instead of letting the planner choose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<usize>,
}

fn default_trainable() -> bool {
    true
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<u64>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            trainable: true,
            shards: None,
            axis: None,
        }
    }

    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = Some(axis);
        self
    }

    pub fn frozen(mut self) -> Self {
        self.trainable = false;
        self
    }

    pub fn numel(&self) -> u64 {
        self.shape.iter().product()
    }
}

/// Logical model definition as seen by the planner: an ordered list of
/// parameter tensors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShapes {
    pub tensors: Vec<TensorSpec>,
}

impl ModelShapes {
    pub fn new(tensors: Vec<TensorSpec>) -> Self {
        Self { tensors }
    }

    /// Low-rank adapter variant of `base`: every base tensor is frozen and each
    /// 2-D tensor `[out, in]` gains trainable `{name}.lora_a` `[rank, in]` and
    /// `{name}.lora_b` `[out, rank]` companions, which inherit the base tensor's
    /// shard count.
    pub fn with_adapter(base: &ModelShapes, rank: u64) -> Self {
        let mut tensors = Vec::with_capacity(base.tensors.len() * 3);
        for tensor in &base.tensors {
            tensors.push(tensor.clone().frozen());
            if let [out_features, in_features] = tensor.shape[..] {
                let companion = |suffix: &str, shape: [u64; 2]| TensorSpec {
                    name: format!("{}.{suffix}", tensor.name),
                    shape: shape.to_vec(),
                    trainable: true,
                    shards: tensor.shards,
                    axis: None,
                };
                tensors.push(companion("lora_a", [rank, in_features]));
                tensors.push(companion("lora_b", [out_features, rank]));
            }
        }
        Self { tensors }
    }

    pub fn numel(&self) -> u64 {
        self.tensors.iter().map(TensorSpec::numel).sum()
    }

    pub fn trainable_numel(&self) -> u64 {
        self.tensors
            .iter()
            .filter(|t| t.trainable)
            .map(TensorSpec::numel)
            .sum()
    }

    pub(crate) fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for tensor in &self.tensors {
            if tensor.name.is_empty()
                || !tensor
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            {
                return Err(PlanError::InvalidModel(format!(
                    "tensor name {:?} must be non-empty and use only [A-Za-z0-9._-]",
                    tensor.name
                )));
            }
            if !seen.insert(tensor.name.as_str()) {
                return Err(PlanError::InvalidModel(format!(
                    "duplicate tensor {:?}",
                    tensor.name
                )));
            }
            if tensor.shape.contains(&0) {
                return Err(PlanError::InvalidModel(format!(
                    "tensor {:?} has a zero-length dimension {:?}",
                    tensor.name, tensor.shape
                )));
            }
            if tensor.shards == Some(0) {
                return Err(PlanError::InvalidModel(format!(
                    "tensor {:?} requests zero shards",
                    tensor.name
                )));
            }
            if let Some(axis) = tensor.axis {
                if axis >= tensor.shape.len() {
                    return Err(PlanError::InvalidModel(format!(
                        "tensor {:?} pins axis {axis} but has only {} dimensions",
                        tensor.name,
                        tensor.shape.len()
                    )));
                }
            }
        }
        Ok(())
    }
}
