//! Minimal tensor runtime: models made of named layers of parameter tensors,
//! their on-disk artifacts and a trainer interface.

pub mod store;
pub mod tensor;
pub mod trainer;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};

pub use store::{ArtifactSnapshot, ModelArtifact};
pub use tensor::Tensor;
pub use trainer::{Batch, Evaluation, FitReport, LinearTrainer, Trainer};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Layer {
    pub name: String,
    pub trainable: bool,
    pub params: Vec<Tensor>,
}

impl Layer {
    pub fn parameter_count(&self) -> usize {
        self.params.iter().map(Tensor::len).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Model {
    pub architecture: String,
    pub layers: Vec<Layer>,
}

impl Model {
    /// A stack of dense layers `sizes[0] -> sizes[1] -> ...`, Glorot-uniform
    /// kernels and zero biases, drawn from a seeded RNG.
    pub fn dense(architecture: impl Into<String>, sizes: &[usize], seed: u64) -> CoreResult<Self> {
        if sizes.len() < 2 || sizes.contains(&0) {
            return Err(CoreError::ShapeMismatch(format!(
                "dense model needs at least two non-zero sizes, got {:?}",
                sizes
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                let kernel = (0..fan_in * fan_out)
                    .map(|_| rng.gen_range(-limit..=limit))
                    .collect();
                let name = format!("dense_{i}");
                Layer {
                    params: vec![
                        Tensor {
                            name: format!("{name}/kernel"),
                            shape: vec![fan_in, fan_out],
                            data: kernel,
                        },
                        Tensor::zeros(format!("{name}/bias"), vec![fan_out]),
                    ],
                    name,
                    trainable: true,
                }
            })
            .collect();

        Ok(Self {
            architecture: architecture.into(),
            layers,
        })
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// All parameter tensors in layer order.
    pub fn parameters(&self) -> impl Iterator<Item = &Tensor> {
        self.layers.iter().flat_map(|l| l.params.iter())
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(Layer::parameter_count).sum()
    }

    pub fn weights(&self) -> Vec<Tensor> {
        self.parameters().cloned().collect()
    }

    /// Replace every parameter tensor. Count and shapes must match.
    pub fn set_weights(&mut self, weights: &[Tensor]) -> CoreResult<()> {
        self.ensure_compatible(weights)?;
        for (param, new) in self
            .layers
            .iter_mut()
            .flat_map(|l| l.params.iter_mut())
            .zip(weights)
        {
            param.data.clone_from(&new.data);
        }
        Ok(())
    }

    /// `w += learning_rate * delta` for every parameter tensor.
    pub fn apply_deltas(&mut self, deltas: &[Tensor], learning_rate: f32) -> CoreResult<()> {
        self.ensure_compatible(deltas)?;
        for (param, delta) in self
            .layers
            .iter_mut()
            .flat_map(|l| l.params.iter_mut())
            .zip(deltas)
        {
            param.add_scaled(delta, learning_rate)?;
        }
        Ok(())
    }

    pub fn ensure_compatible(&self, tensors: &[Tensor]) -> CoreResult<()> {
        let count = self.parameters().count();
        if count != tensors.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "model has {} parameter tensors, got {}",
                count,
                tensors.len()
            )));
        }
        for (param, other) in self.parameters().zip(tensors) {
            param.ensure_same_shape(other)?;
        }
        Ok(())
    }

    /// Mark the named layers non-trainable. Unknown names are an error.
    pub fn freeze_layers(&mut self, names: &[String]) -> CoreResult<()> {
        let known: HashSet<&str> = self.layers.iter().map(|l| l.name.as_str()).collect();
        if let Some(unknown) = names.iter().find(|n| !known.contains(n.as_str())) {
            return Err(CoreError::NotFound(format!("layer '{unknown}'")));
        }
        for layer in &mut self.layers {
            if names.contains(&layer.name) {
                layer.trainable = false;
            }
        }
        Ok(())
    }

    pub fn architecture_stats(&self) -> ArchitectureStats {
        let trainable_params = self
            .layers
            .iter()
            .filter(|l| l.trainable)
            .map(Layer::parameter_count)
            .sum();
        let total_params = self.parameter_count();
        ArchitectureStats {
            architecture: self.architecture.clone(),
            layer_count: self.layers.len(),
            total_params,
            trainable_params,
            frozen_params: total_params - trainable_params,
            frozen_layers: self
                .layers
                .iter()
                .filter(|l| !l.trainable)
                .map(|l| l.name.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureStats {
    pub architecture: String,
    pub layer_count: usize,
    pub total_params: usize,
    pub trainable_params: usize,
    pub frozen_params: usize,
    pub frozen_layers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingRecord {
    pub timestamp: DateTime<Utc>,
    pub epochs: usize,
    pub samples: usize,
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecord {
    pub timestamp: DateTime<Utc>,
    pub contributors: usize,
    pub learning_rate: f64,
    pub previous_version: String,
    pub new_version: String,
}

/// Clone-specific metadata carried by learner instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloneInfo {
    pub source_version: String,
    pub learner_id: String,
    pub frozen_layers: Vec<String>,
    pub cloned_at: DateTime<Utc>,
}

/// Sidecar written next to every model artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub architecture: ArchitectureStats,
    /// blake3 of `model.json`, filled in on save.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub update_count: u64,
    #[serde(default)]
    pub training_history: Vec<TrainingRecord>,
    #[serde(default)]
    pub federated_updates: Vec<MergeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneInfo>,
}

impl ModelMetadata {
    pub fn new(version: impl Into<String>, model: &Model) -> Self {
        let now = Utc::now();
        Self {
            version: version.into(),
            created_at: now,
            updated_at: now,
            architecture: model.architecture_stats(),
            checksum: String::new(),
            update_count: 0,
            training_history: Vec::new(),
            federated_updates: Vec::new(),
            clone: None,
        }
    }
}

/// Next semantic-ish version: bumps the last numeric component, or appends
/// `.1` when there is none (`"1.0.0"` -> `"1.0.1"`, `"base"` -> `"base.1"`).
pub fn bump_version(version: &str) -> String {
    match version.rsplit_once('.') {
        Some((head, tail)) => match tail.parse::<u64>() {
            Ok(n) => format!("{head}.{}", n + 1),
            Err(_) => format!("{version}.1"),
        },
        None => match version.parse::<u64>() {
            Ok(n) => (n + 1).to_string(),
            Err(_) => format!("{version}.1"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_model_shapes() {
        let model = Model::dense("mlp", &[4, 3, 2], 7).unwrap();
        assert_eq!(model.layers.len(), 2);
        assert_eq!(model.parameter_count(), 4 * 3 + 3 + 3 * 2 + 2);
        assert_eq!(model.layers[0].params[0].shape, vec![4, 3]);
        assert_eq!(model, Model::dense("mlp", &[4, 3, 2], 7).unwrap());
    }

    #[test]
    fn test_freeze_layers_updates_stats() {
        let mut model = Model::dense("mlp", &[2, 2, 1], 1).unwrap();
        model.freeze_layers(&["dense_0".to_string()]).unwrap();
        let stats = model.architecture_stats();
        assert_eq!(stats.frozen_layers, vec!["dense_0"]);
        assert_eq!(stats.frozen_params, 6);
        assert_eq!(stats.trainable_params, 3);
        assert!(model.freeze_layers(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_apply_deltas() {
        let mut model = Model::dense("mlp", &[1, 1], 3).unwrap();
        let before = model.weights();
        let deltas: Vec<Tensor> = before
            .iter()
            .map(|t| Tensor {
                data: vec![1.0; t.len()],
                ..t.clone()
            })
            .collect();
        model.apply_deltas(&deltas, 0.5).unwrap();
        for (b, a) in before.iter().zip(model.weights()) {
            assert!((a.data[0] - b.data[0] - 0.5).abs() < 1e-6);
        }
        assert!(model.apply_deltas(&deltas[..1], 1.0).is_err());
    }

    #[test]
    fn test_bump_version() {
        assert_eq!(bump_version("1.0.0"), "1.0.1");
        assert_eq!(bump_version("7"), "8");
        assert_eq!(bump_version("base"), "base.1");
        assert_eq!(bump_version("v1.beta"), "v1.beta.1");
    }
}
