//! Local training on learner clones, update aggregation and shared-model
//! merging.

pub mod privacy;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub use privacy::{calculate_privacy_budget, PrivacyEngine, PrivacyReport};

use crate::error::{CoreError, CoreResult};
use crate::model::{
    bump_version, Batch, Evaluation, MergeRecord, Model, ModelArtifact, ModelMetadata, Tensor,
    Trainer, TrainingRecord,
};
use crate::registry::ModelMetrics;
use crate::settings::FederationConfig;

/// How learner deltas are combined.
///
/// `FedProx` is an alias of `Weighted`: no proximal term is applied during
/// local training.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    FedAvg,
    #[default]
    Weighted,
    FedProx,
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FedAvg => "fedavg",
            Self::Weighted => "weighted",
            Self::FedProx => "fedprox",
        };
        f.write_str(name)
    }
}

/// One learner's contribution to an aggregation round.
#[derive(Debug, Clone, PartialEq)]
pub struct FederatedUpdate {
    pub learner_id: String,
    pub weight_deltas: Vec<Tensor>,
    pub num_samples: usize,
    pub training_metrics: ModelMetrics,
    pub timestamp: DateTime<Utc>,
}

pub struct FederatedLearningManager {
    config: FederationConfig,
    trainer: Arc<dyn Trainer>,
    privacy: Mutex<PrivacyEngine>,
    training_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl FederatedLearningManager {
    pub fn new(config: FederationConfig, trainer: Arc<dyn Trainer>) -> CoreResult<Self> {
        let privacy = PrivacyEngine::new(
            config.clip_norm,
            config.noise_multiplier,
            config.enable_differential_privacy,
        )?;
        if config.enable_differential_privacy && privacy.effective_noise().is_none() {
            warn!(
                "Differential privacy enabled without a positive noise_multiplier; \
                 updates will not be noised"
            );
        }
        Ok(Self {
            config,
            trainer,
            privacy: Mutex::new(privacy),
            training_locks: DashMap::new(),
        })
    }

    /// Seed the noise generator (for testing).
    pub fn with_seed(mut self, seed: u64) -> Self {
        let engine = self.privacy.into_inner().with_seed(seed);
        self.privacy = Mutex::new(engine);
        self
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn is_training(&self, learner_id: &str) -> bool {
        self.training_locks
            .get(learner_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Fit the learner's clone for `local_epochs`, privatize the resulting
    /// deltas and persist `original + delta` back to the clone.
    #[instrument(skip(self, artifact, batches), fields(batches = batches.len()))]
    pub async fn train_local_model(
        &self,
        learner_id: &str,
        artifact: &ModelArtifact,
        batches: &[Batch],
    ) -> CoreResult<FederatedUpdate> {
        let lock = self
            .training_locks
            .entry(learner_id.to_string())
            .or_default()
            .clone();
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| CoreError::TrainingInProgress(learner_id.to_string()))?;

        let (mut model, mut metadata) = artifact.load()?;
        let original = model.weights();

        let report = self.trainer.fit(&mut model, batches, self.config.local_epochs)?;

        let mut deltas = model
            .weights()
            .iter()
            .zip(&original)
            .map(|(updated, before)| updated.sub(before))
            .collect::<CoreResult<Vec<_>>>()?;
        let privacy = self.privacy.lock().apply(&mut deltas)?;
        if privacy.clipped_tensors > 0 {
            debug!(
                "Clipped {} delta tensor(s) for learner {}",
                privacy.clipped_tensors, learner_id
            );
        }

        let mut privatized = original;
        for (weight, delta) in privatized.iter_mut().zip(&deltas) {
            weight.add_scaled(delta, 1.0)?;
        }
        model.set_weights(&privatized)?;

        let timestamp = Utc::now();
        metadata.training_history.push(TrainingRecord {
            timestamp,
            epochs: report.epochs,
            samples: report.samples,
            loss: report.final_metrics.loss,
            accuracy: report.final_metrics.accuracy,
        });
        artifact.save(&model, &mut metadata)?;

        info!(
            "Local training for {} finished: {} samples, loss {:.4}, accuracy {:.3}",
            learner_id, report.samples, report.final_metrics.loss, report.final_metrics.accuracy
        );

        Ok(FederatedUpdate {
            learner_id: learner_id.to_string(),
            weight_deltas: deltas,
            num_samples: report.samples,
            training_metrics: ModelMetrics {
                loss: report.final_metrics.loss,
                accuracy: report.final_metrics.accuracy,
            },
            timestamp,
        })
    }

    /// Combine the deltas of `updates` into one delta per parameter tensor.
    pub fn aggregate_updates(
        &self,
        updates: &[FederatedUpdate],
        strategy: AggregationStrategy,
    ) -> CoreResult<Vec<Tensor>> {
        let Some(first) = updates.first() else {
            return Err(CoreError::AggregationQuorumNotMet {
                required: 1,
                available: 0,
            });
        };

        for update in &updates[1..] {
            if update.weight_deltas.len() != first.weight_deltas.len() {
                return Err(CoreError::ShapeMismatch(format!(
                    "learner '{}' sent {} tensors, expected {}",
                    update.learner_id,
                    update.weight_deltas.len(),
                    first.weight_deltas.len()
                )));
            }
            for (a, b) in first.weight_deltas.iter().zip(&update.weight_deltas) {
                a.ensure_same_shape(b)?;
            }
        }

        let uniform = 1.0 / updates.len() as f64;
        let total_samples: usize = updates.iter().map(|u| u.num_samples).sum();
        let weights: Vec<f64> = match strategy {
            AggregationStrategy::FedAvg => vec![uniform; updates.len()],
            AggregationStrategy::Weighted | AggregationStrategy::FedProx => {
                if total_samples == 0 {
                    warn!("All updates report zero samples; falling back to uniform weights");
                    vec![uniform; updates.len()]
                } else {
                    updates
                        .iter()
                        .map(|u| u.num_samples as f64 / total_samples as f64)
                        .collect()
                }
            }
        };

        let mut aggregated: Vec<Tensor> = first
            .weight_deltas
            .iter()
            .map(|t| Tensor::zeros(t.name.clone(), t.shape.clone()))
            .collect();
        for (update, weight) in updates.iter().zip(&weights) {
            for (acc, delta) in aggregated.iter_mut().zip(&update.weight_deltas) {
                acc.add_scaled(delta, *weight as f32)?;
            }
        }

        debug!(
            "Aggregated {} updates ({} samples) with {}",
            updates.len(),
            total_samples,
            strategy
        );
        Ok(aggregated)
    }

    /// Apply `current + learning_rate * delta` to the shared model, bump its
    /// version and append a merge record.
    #[instrument(skip(self, artifact, deltas), fields(dir = ?artifact.dir()))]
    pub fn update_main_model(
        &self,
        artifact: &ModelArtifact,
        deltas: &[Tensor],
        learning_rate: f64,
        contributors: usize,
    ) -> CoreResult<ModelMetadata> {
        let (mut model, mut metadata) = artifact.load()?;
        model.apply_deltas(deltas, learning_rate as f32)?;

        let previous_version = metadata.version.clone();
        metadata.version = bump_version(&previous_version);
        metadata.update_count += 1;
        metadata.federated_updates.push(MergeRecord {
            timestamp: Utc::now(),
            contributors,
            learning_rate,
            previous_version: previous_version.clone(),
            new_version: metadata.version.clone(),
        });
        artifact.save(&model, &mut metadata)?;

        info!(
            "Shared model updated {} -> {} from {} contributor(s)",
            previous_version, metadata.version, contributors
        );
        Ok(metadata)
    }

    pub fn evaluate(&self, model: &Model, batches: &[Batch]) -> CoreResult<Evaluation> {
        self.trainer.evaluate(model, batches)
    }

    /// Epsilon estimate for one local-training run over `dataset_size`
    /// samples, or `None` when noise is not being added.
    pub fn privacy_budget(&self, dataset_size: usize) -> CoreResult<Option<f64>> {
        let Some(noise) = self.privacy.lock().effective_noise() else {
            return Ok(None);
        };
        calculate_privacy_budget(
            self.config.local_epochs,
            self.config.batch_size,
            dataset_size,
            noise,
            self.config.dp_delta,
        )
        .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearTrainer;

    fn manager(config: FederationConfig) -> FederatedLearningManager {
        FederatedLearningManager::new(config, Arc::new(LinearTrainer::new(0.05))).unwrap()
    }

    fn scalar_update(learner: &str, samples: usize, delta: f32) -> FederatedUpdate {
        FederatedUpdate {
            learner_id: learner.to_string(),
            weight_deltas: vec![Tensor::scalar("w", delta)],
            num_samples: samples,
            training_metrics: ModelMetrics::default(),
            timestamp: Utc::now(),
        }
    }

    fn line() -> Vec<Batch> {
        let xs = [-1.0f32, 0.0, 1.0, 2.0];
        vec![Batch::new(
            xs.iter().map(|x| vec![*x]).collect(),
            xs.iter().map(|x| vec![3.0 * x - 1.0]).collect(),
        )
        .unwrap()]
    }

    #[test]
    fn test_weighted_aggregation() {
        let fl = manager(FederationConfig::default());
        let updates = [scalar_update("a", 100, 2.0), scalar_update("b", 300, 4.0)];

        let weighted = fl.aggregate_updates(&updates, AggregationStrategy::Weighted).unwrap();
        assert!((weighted[0].data[0] - 3.5).abs() < 1e-6);

        let fedavg = fl.aggregate_updates(&updates, AggregationStrategy::FedAvg).unwrap();
        assert!((fedavg[0].data[0] - 3.0).abs() < 1e-6);

        let fedprox = fl.aggregate_updates(&updates, AggregationStrategy::FedProx).unwrap();
        assert_eq!(fedprox, weighted);
    }

    #[test]
    fn test_aggregation_rejects_bad_input() {
        let fl = manager(FederationConfig::default());
        assert!(matches!(
            fl.aggregate_updates(&[], AggregationStrategy::Weighted),
            Err(CoreError::AggregationQuorumNotMet { .. })
        ));

        let mut odd = scalar_update("b", 1, 1.0);
        odd.weight_deltas = vec![Tensor::zeros("w", vec![2])];
        let updates = [scalar_update("a", 1, 1.0), odd];
        let result = fl.aggregate_updates(&updates, AggregationStrategy::FedAvg);
        assert!(matches!(result, Err(CoreError::ShapeMismatch(_))));
    }

    #[test]
    fn test_zero_samples_fall_back_to_uniform() {
        let fl = manager(FederationConfig::default());
        let updates = [scalar_update("a", 0, 1.0), scalar_update("b", 0, 3.0)];
        let out = fl.aggregate_updates(&updates, AggregationStrategy::Weighted).unwrap();
        assert!((out[0].data[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(AggregationStrategy::FedAvg.to_string(), "fedavg");
        let parsed: AggregationStrategy = serde_json::from_str("\"fedprox\"").unwrap();
        assert_eq!(parsed, AggregationStrategy::FedProx);
    }

    #[tokio::test]
    async fn test_train_local_model_persists_update() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ModelArtifact::at(dir.path().join("alice"));
        let model = Model::dense("line", &[1, 1], 4).unwrap();
        artifact.save(&model, &mut ModelMetadata::new("1.0.0", &model)).unwrap();

        let fl = manager(FederationConfig {
            local_epochs: 3,
            clip_norm: None,
            ..FederationConfig::default()
        });
        let update = fl.train_local_model("alice", &artifact, &line()).await.unwrap();
        assert_eq!(update.num_samples, 4);

        let (trained, metadata) = artifact.load().unwrap();
        assert_eq!(metadata.training_history.len(), 1);
        assert_eq!(metadata.training_history[0].epochs, 3);
        let pairs = trained.weights().into_iter().zip(model.weights());
        for ((after, before), delta) in pairs.zip(&update.weight_deltas) {
            let expected = before.add(delta).unwrap();
            for (a, e) in after.data.iter().zip(&expected.data) {
                assert!((a - e).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_deltas_are_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ModelArtifact::at(dir.path().join("bob"));
        let model = Model::dense("line", &[1, 1], 4).unwrap();
        artifact.save(&model, &mut ModelMetadata::new("1.0.0", &model)).unwrap();

        let fl = manager(FederationConfig {
            local_epochs: 50,
            clip_norm: Some(0.01),
            ..FederationConfig::default()
        });
        let update = fl.train_local_model("bob", &artifact, &line()).await.unwrap();
        assert!(update.weight_deltas.iter().all(|t| t.l2_norm() <= 0.01 + 1e-6));
    }

    #[tokio::test]
    async fn test_concurrent_training_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ModelArtifact::at(dir.path().join("carol"));
        let model = Model::dense("line", &[1, 1], 4).unwrap();
        artifact.save(&model, &mut ModelMetadata::new("1.0.0", &model)).unwrap();

        let fl = manager(FederationConfig::default());
        let lock = fl.training_locks.entry("carol".to_string()).or_default().clone();
        let held = lock.try_lock_owned().unwrap();
        assert!(fl.is_training("carol"));

        let result = fl.train_local_model("carol", &artifact, &line()).await;
        assert!(matches!(result, Err(CoreError::TrainingInProgress(_))));

        drop(held);
        assert!(!fl.is_training("carol"));
        assert!(fl.train_local_model("carol", &artifact, &line()).await.is_ok());
    }

    #[test]
    fn test_update_main_model_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ModelArtifact::at(dir.path().join("main"));
        let model = Model::dense("mlp", &[1, 1], 2).unwrap();
        artifact.save(&model, &mut ModelMetadata::new("1.0.0", &model)).unwrap();

        let fl = manager(FederationConfig::default());
        let deltas: Vec<Tensor> = model
            .weights()
            .iter()
            .map(|t| Tensor::new(t.name.clone(), t.shape.clone(), vec![1.0; t.len()]).unwrap())
            .collect();
        let metadata = fl.update_main_model(&artifact, &deltas, 0.5, 2).unwrap();

        assert_eq!(metadata.version, "1.0.1");
        assert_eq!(metadata.update_count, 1);
        assert_eq!(metadata.federated_updates[0].contributors, 2);
        assert_eq!(metadata.federated_updates[0].previous_version, "1.0.0");

        let (updated, _) = artifact.load().unwrap();
        for (after, before) in updated.parameters().zip(model.parameters()) {
            for (a, b) in after.data.iter().zip(&before.data) {
                assert!((a - b - 0.5).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_privacy_budget_only_with_noise() {
        let fl = manager(FederationConfig::default());
        assert_eq!(fl.privacy_budget(100).unwrap(), None);

        let noisy = manager(FederationConfig {
            enable_differential_privacy: true,
            noise_multiplier: Some(1.0),
            local_epochs: 5,
            batch_size: 10,
            ..FederationConfig::default()
        });
        let eps = noisy.privacy_budget(100).unwrap().unwrap();
        assert!((eps - 5.0).abs() < 1e-9);
    }
}
