//! Structural cloning of the shared model into learner instances, weight
//! deltas and similarity scoring.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{CoreError, CoreResult};
use crate::model::{CloneInfo, Model, ModelArtifact, ModelMetadata, Tensor};

/// Per-layer and overall `1 / (1 + mse)` similarity between two models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityReport {
    pub overall: f64,
    pub per_layer: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelCloner {
    default_frozen_layers: Vec<String>,
}

impl ModelCloner {
    pub fn new(default_frozen_layers: Vec<String>) -> Self {
        Self {
            default_frozen_layers,
        }
    }

    /// Copy the shared model at `source` into `target` for `learner_id`,
    /// freezing `frozen_layers` (or the configured defaults when empty).
    #[instrument(skip(self, source, target, frozen_layers), fields(target = ?target.dir()))]
    pub fn clone_model(
        &self,
        source: &ModelArtifact,
        target: &ModelArtifact,
        learner_id: &str,
        frozen_layers: &[String],
    ) -> CoreResult<ModelMetadata> {
        let (mut model, source_metadata) = source.load()?;

        let frozen = if frozen_layers.is_empty() {
            self.default_frozen_layers.as_slice()
        } else {
            frozen_layers
        };
        model.freeze_layers(frozen)?;

        let mut metadata = ModelMetadata::new(source_metadata.version.clone(), &model);
        metadata.clone = Some(CloneInfo {
            source_version: source_metadata.version,
            learner_id: learner_id.to_string(),
            frozen_layers: frozen.to_vec(),
            cloned_at: Utc::now(),
        });
        target.save(&model, &mut metadata)?;

        info!(
            "Cloned model {} for learner {} ({} params, {} frozen)",
            metadata.version,
            learner_id,
            metadata.architecture.total_params,
            metadata.architecture.frozen_params
        );
        Ok(metadata)
    }

    /// Load a clone. Artifacts without clone metadata are rejected.
    pub fn load_clone(&self, target: &ModelArtifact) -> CoreResult<(Model, ModelMetadata)> {
        let (model, metadata) = target.load()?;
        if metadata.clone.is_none() {
            return Err(CoreError::model_io(
                target.metadata_path(),
                "artifact is not a learner clone",
            ));
        }
        Ok((model, metadata))
    }

    /// Overwrite a clone's weights in place, keeping its layer flags.
    /// Returns the new update count.
    pub fn update_clone_weights(
        &self,
        target: &ModelArtifact,
        weights: &[Tensor],
    ) -> CoreResult<u64> {
        let (mut model, mut metadata) = self.load_clone(target)?;
        model.set_weights(weights)?;
        metadata.update_count += 1;
        target.save(&model, &mut metadata)?;
        debug!("Updated clone weights at {:?} (update {})", target.dir(), metadata.update_count);
        Ok(metadata.update_count)
    }

    pub fn calculate_similarity(&self, a: &Model, b: &Model) -> CoreResult<SimilarityReport> {
        if a.layers.len() != b.layers.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "models have {} and {} layers",
                a.layers.len(),
                b.layers.len()
            )));
        }

        let mut per_layer = Vec::with_capacity(a.layers.len());
        let mut total_sq = 0.0;
        let mut total_params = 0usize;

        for (la, lb) in a.layers.iter().zip(&b.layers) {
            if la.name != lb.name || la.params.len() != lb.params.len() {
                return Err(CoreError::ShapeMismatch(format!(
                    "layer '{}' does not match '{}'",
                    la.name, lb.name
                )));
            }
            let mut layer_sq = 0.0;
            for (ta, tb) in la.params.iter().zip(&lb.params) {
                layer_sq += ta.squared_distance(tb)?;
            }
            let count = la.parameter_count();
            let mse = if count == 0 { 0.0 } else { layer_sq / count as f64 };
            per_layer.push((la.name.clone(), 1.0 / (1.0 + mse)));
            total_sq += layer_sq;
            total_params += count;
        }

        let overall_mse = if total_params == 0 {
            0.0
        } else {
            total_sq / total_params as f64
        };
        Ok(SimilarityReport {
            overall: 1.0 / (1.0 + overall_mse),
            per_layer,
        })
    }

    /// `learner - main` for every parameter tensor.
    pub fn extract_weight_deltas(&self, main: &Model, learner: &Model) -> CoreResult<Vec<Tensor>> {
        main.ensure_compatible(&learner.weights())?;
        learner
            .parameters()
            .zip(main.parameters())
            .map(|(l, m)| l.sub(m))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn main_artifact(dir: &Path) -> (ModelArtifact, Model) {
        let artifact = ModelArtifact::at(dir.join("main"));
        let model = Model::dense("mlp", &[3, 4, 2], 21).unwrap();
        let mut metadata = ModelMetadata::new("1.0.0", &model);
        artifact.save(&model, &mut metadata).unwrap();
        (artifact, model)
    }

    #[test]
    fn test_clone_is_identical_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let (main, model) = main_artifact(dir.path());
        let cloner = ModelCloner::default();
        let target = ModelArtifact::at(dir.path().join("learners/alice"));

        let metadata = cloner.clone_model(&main, &target, "alice", &[]).unwrap();
        assert_eq!(metadata.clone.as_ref().unwrap().source_version, "1.0.0");
        assert!(metadata.training_history.is_empty());

        let (cloned, _) = cloner.load_clone(&target).unwrap();
        let similarity = cloner.calculate_similarity(&model, &cloned).unwrap();
        assert_eq!(similarity.overall, 1.0);
        assert!(similarity.per_layer.iter().all(|(_, s)| *s == 1.0));
    }

    #[test]
    fn test_frozen_layers_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (main, _) = main_artifact(dir.path());
        let cloner = ModelCloner::new(vec!["dense_0".to_string()]);
        let target = ModelArtifact::at(dir.path().join("learners/bob"));

        let metadata = cloner.clone_model(&main, &target, "bob", &[]).unwrap();
        assert_eq!(metadata.architecture.frozen_layers, vec!["dense_0"]);
        assert_eq!(metadata.clone.unwrap().frozen_layers, vec!["dense_0"]);
        let (cloned, _) = cloner.load_clone(&target).unwrap();
        assert!(!cloned.layers[0].trainable);
    }

    #[test]
    fn test_deltas_are_anti_symmetric() {
        let cloner = ModelCloner::default();
        let main = Model::dense("mlp", &[2, 2], 1).unwrap();
        let learner = Model::dense("mlp", &[2, 2], 2).unwrap();

        let forward = cloner.extract_weight_deltas(&main, &learner).unwrap();
        let backward = cloner.extract_weight_deltas(&learner, &main).unwrap();
        for (f, b) in forward.iter().zip(&backward) {
            assert_eq!(f.data, b.scale(-1.0).data);
        }
    }

    #[test]
    fn test_similarity_decreases_with_distance() {
        let cloner = ModelCloner::default();
        let a = Model::dense("mlp", &[1, 1], 1).unwrap();
        let mut b = a.clone();
        b.layers[0].params[0].data[0] += 1.0;
        // One of two parameters differs by 1: mse = 0.5.
        let report = cloner.calculate_similarity(&a, &b).unwrap();
        assert!((report.overall - 1.0 / 1.5).abs() < 1e-9);

        let other = Model::dense("mlp", &[1, 2], 1).unwrap();
        assert!(cloner.calculate_similarity(&a, &other).is_err());
    }

    #[test]
    fn test_update_clone_weights_bumps_count() {
        let dir = tempfile::tempdir().unwrap();
        let (main, model) = main_artifact(dir.path());
        let cloner = ModelCloner::new(vec!["dense_1".to_string()]);
        let target = ModelArtifact::at(dir.path().join("learners/carol"));
        cloner.clone_model(&main, &target, "carol", &[]).unwrap();

        let pushed: Vec<Tensor> = model.weights().iter().map(|t| t.scale(2.0)).collect();
        assert_eq!(cloner.update_clone_weights(&target, &pushed).unwrap(), 1);
        assert_eq!(cloner.update_clone_weights(&target, &pushed).unwrap(), 2);

        let (updated, _) = cloner.load_clone(&target).unwrap();
        assert_eq!(updated.weights(), pushed);
        assert!(!updated.layers[1].trainable);
    }

    #[test]
    fn test_plain_artifact_is_not_a_clone() {
        let dir = tempfile::tempdir().unwrap();
        let (main, _) = main_artifact(dir.path());
        assert!(ModelCloner::default().load_clone(&main).is_err());
    }
}
