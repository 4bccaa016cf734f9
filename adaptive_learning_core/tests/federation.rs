//! Federated learning flow: bootstrap a shared model, enroll learners,
//! train locally and aggregate.

use adaptive_learning_core::{
    aggregation::{FederatedAggregationService, JobStatus},
    cloner::ModelCloner,
    federated::{AggregationStrategy, FederatedLearningManager, FederatedUpdate},
    model::{Batch, LinearTrainer, Model, ModelArtifact, Tensor},
    registry::{ModelMetrics, ModelRegistry},
    settings::{AggregationConfig, FederationConfig, ModelsConfig},
};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing_test::traced_test;

fn linear_data(slope: f32, intercept: f32) -> Vec<Batch> {
    let xs = [-1.0f32, -0.5, 0.0, 0.5, 1.0];
    vec![Batch::new(
        xs.iter().map(|x| vec![*x]).collect(),
        xs.iter().map(|x| vec![slope * x + intercept]).collect(),
    )
    .unwrap()]
}

fn service(
    dir: &Path,
    federation: FederationConfig,
    minimum_learners: usize,
) -> FederatedAggregationService {
    let registry = Arc::new(ModelRegistry::open(dir.join("registry")).unwrap());
    let manager = Arc::new(
        FederatedLearningManager::new(federation, Arc::new(LinearTrainer::new(0.1)))
            .unwrap()
            .with_seed(11),
    );
    FederatedAggregationService::new(
        registry,
        manager,
        ModelsConfig {
            main_model_dir: dir.join("main"),
            learner_models_dir: dir.join("learners"),
            frozen_layers: Vec::new(),
        },
        AggregationConfig {
            minimum_learners,
            push_down_updates: true,
            ..AggregationConfig::default()
        },
    )
}

#[test]
fn test_weighted_aggregation_of_scalar_deltas() {
    let trainer = Arc::new(LinearTrainer::default());
    let manager = FederatedLearningManager::new(FederationConfig::default(), trainer).unwrap();
    let update = |learner: &str, samples: usize, delta: f32| FederatedUpdate {
        learner_id: learner.to_string(),
        weight_deltas: vec![Tensor::scalar("w", delta)],
        num_samples: samples,
        training_metrics: ModelMetrics::default(),
        timestamp: Utc::now(),
    };

    let aggregated = manager
        .aggregate_updates(
            &[update("a", 100, 2.0), update("b", 300, 4.0)],
            AggregationStrategy::Weighted,
        )
        .unwrap();
    assert!((aggregated[0].data[0] - 3.5).abs() < 1e-6);
}

#[test]
fn test_clone_round_trip_similarity() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(dir.path(), FederationConfig::default(), 1);
    let model = Model::dense("mlp", &[2, 3, 1], 5).unwrap();
    svc.bootstrap_main_model(&model, "1.0.0", ModelMetrics::default()).unwrap();
    let instance = svc.enroll_learner("alice").unwrap();

    let cloner = ModelCloner::default();
    let (clone, _) = cloner.load_clone(&ModelArtifact::at(&instance.model_path)).unwrap();
    let similarity = cloner.calculate_similarity(&model, &clone).unwrap();
    assert_eq!(similarity.overall, 1.0);
}

#[tokio::test]
#[traced_test]
async fn test_full_round_with_privacy() {
    let dir = tempfile::tempdir().unwrap();
    let federation = FederationConfig {
        local_epochs: 20,
        learning_rate: 1.0,
        enable_differential_privacy: true,
        clip_norm: Some(5.0),
        noise_multiplier: Some(0.001),
        batch_size: 5,
        ..FederationConfig::default()
    };
    let svc = service(dir.path(), federation, 3);
    let model = Model::dense("line", &[1, 1], 3).unwrap();
    svc.bootstrap_main_model(&model, "1.0.0", ModelMetrics::default()).unwrap();
    svc.set_evaluation_data(linear_data(2.0, 1.0));

    for learner in ["alice", "bob", "carol"] {
        svc.enroll_learner(learner).unwrap();
    }
    // Only two learners have trained: no job yet.
    for learner in ["alice", "bob"] {
        svc.record_local_training(learner, &linear_data(2.0, 1.0)).await.unwrap();
    }
    assert!(svc.schedule_aggregation().is_none());

    svc.record_local_training("carol", &linear_data(2.0, 1.0)).await.unwrap();
    let job = svc.run_once().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.aggregation_results);
    assert_eq!(job.contributing_learners.len(), 3);

    let results = job.aggregation_results.unwrap();
    assert!(results.privacy_budget.unwrap() > 0.0);
    assert!(results.updated.unwrap().loss < results.baseline.unwrap().loss);

    let stats = svc.registry().statistics();
    assert_eq!(stats.total_federated_updates, 1);
    assert_eq!(stats.active_learners, 3);

    // Push-down brought every clone in line with the shared model.
    let (shared, _) = svc.main_artifact().load().unwrap();
    let cloner = ModelCloner::default();
    for learner in ["alice", "bob", "carol"] {
        let instance = svc.registry().get_learner_model(learner).unwrap();
        let artifact = ModelArtifact::at(&instance.model_path);
        let (clone, metadata) = cloner.load_clone(&artifact).unwrap();
        assert_eq!(metadata.update_count, 1);
        assert_eq!(cloner.calculate_similarity(&shared, &clone).unwrap().overall, 1.0);
    }
}
