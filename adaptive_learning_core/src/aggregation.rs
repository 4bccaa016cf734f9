//! Scheduled federated aggregation: picks eligible learners, merges their
//! deltas into the shared model and records the outcome in the registry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cloner::ModelCloner;
use crate::error::{CoreError, CoreResult};
use crate::federated::{FederatedLearningManager, FederatedUpdate};
use crate::model::{Batch, Model, ModelArtifact, ModelMetadata};
use crate::registry::{
    FederatedUpdateRecord, LearnerModelInstance, LearnerStatus, MainModelVersion, ModelMetrics,
    ModelRegistry, TrainingSession,
};
use crate::settings::{AggregationConfig, ModelsConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Jobs only move forward: pending -> running -> completed | failed,
    /// and a pending job may fail without ever starting.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResults {
    pub performance_improvement: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<ModelMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<ModelMetrics>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregationJob {
    pub job_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub eligible_learners: Vec<String>,
    pub contributing_learners: Vec<String>,
    pub aggregation_results: Option<AggregationResults>,
}

impl AggregationJob {
    pub fn new(eligible_learners: Vec<String>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: JobStatus::Pending,
            eligible_learners,
            contributing_learners: Vec::new(),
            aggregation_results: None,
        }
    }

    /// Move to `next`, stamping start/completion times.
    pub fn transition(&mut self, next: JobStatus) -> CoreResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidJobTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed => self.completed_at = Some(now),
            JobStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> CoreResult<()> {
        self.transition(JobStatus::Failed)?;
        let results = self.aggregation_results.get_or_insert_with(AggregationResults::default);
        results.error = Some(message.into());
        Ok(())
    }
}

pub struct FederatedAggregationService {
    registry: Arc<ModelRegistry>,
    cloner: ModelCloner,
    manager: Arc<FederatedLearningManager>,
    models: ModelsConfig,
    config: AggregationConfig,
    evaluation_data: RwLock<Vec<Batch>>,
    jobs: DashMap<String, AggregationJob>,
    execution_lock: tokio::sync::Mutex<()>,
}

impl FederatedAggregationService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        manager: Arc<FederatedLearningManager>,
        models: ModelsConfig,
        config: AggregationConfig,
    ) -> Self {
        Self {
            registry,
            cloner: ModelCloner::new(models.frozen_layers.clone()),
            manager,
            models,
            config,
            evaluation_data: RwLock::new(Vec::new()),
            jobs: DashMap::new(),
            execution_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn main_artifact(&self) -> ModelArtifact {
        ModelArtifact::at(&self.models.main_model_dir)
    }

    /// Held-out batches used for the before/after comparison.
    pub fn set_evaluation_data(&self, batches: Vec<Batch>) {
        *self.evaluation_data.write() = batches;
    }

    /// Persist `model` as the shared model and register it as `version`.
    pub fn bootstrap_main_model(
        &self,
        model: &Model,
        version: &str,
        metrics: ModelMetrics,
    ) -> CoreResult<MainModelVersion> {
        if self.registry.get_main_model(version).is_some() {
            return Err(CoreError::AlreadyExists(format!("main model version {version}")));
        }

        let artifact = self.main_artifact();
        let mut metadata = ModelMetadata::new(version, model);
        artifact.save(model, &mut metadata)?;

        let entry = MainModelVersion {
            version: version.to_string(),
            model_path: self.models.main_model_dir.clone(),
            created_at: Utc::now(),
            training_metrics: metrics,
            architecture: metadata.architecture,
            federated_updates: Vec::new(),
        };
        self.registry.register_main_version(entry.clone())?;
        info!("Bootstrapped shared model {} at {:?}", version, artifact.dir());
        Ok(entry)
    }

    /// Clone the latest shared model for `learner_id` and register the clone.
    #[instrument(skip(self))]
    pub fn enroll_learner(&self, learner_id: &str) -> CoreResult<LearnerModelInstance> {
        let latest = self
            .registry
            .latest_main_version()
            .ok_or_else(|| CoreError::NotFound("no shared model has been registered".to_string()))?;

        let source = ModelArtifact::at(&latest.model_path);
        let target_dir = self.models.learner_dir(learner_id);
        let target = ModelArtifact::at(&target_dir);
        let metadata = self.cloner.clone_model(&source, &target, learner_id, &[])?;

        let instance = LearnerModelInstance::new(learner_id, target_dir, metadata.version);
        self.registry.register_learner_model(instance.clone())?;
        Ok(instance)
    }

    /// Train the learner's clone locally and record the session. Archived
    /// learners are rejected and keep their status.
    #[instrument(skip(self, batches), fields(batches = batches.len()))]
    pub async fn record_local_training(
        &self,
        learner_id: &str,
        batches: &[Batch],
    ) -> CoreResult<TrainingSession> {
        let instance = self
            .registry
            .get_learner_model(learner_id)
            .ok_or_else(|| CoreError::NotFound(format!("learner model {learner_id}")))?;
        if instance.status == LearnerStatus::Archived {
            return Err(CoreError::LearnerArchived(learner_id.to_string()));
        }
        let artifact = ModelArtifact::at(&instance.model_path);

        self.registry.set_learner_status(learner_id, LearnerStatus::Training)?;
        let update = match self.manager.train_local_model(learner_id, &artifact, batches).await {
            Ok(update) => update,
            // The run already in progress owns the status flag.
            Err(e @ CoreError::TrainingInProgress(_)) => return Err(e),
            Err(e) => {
                self.registry.set_learner_status(learner_id, LearnerStatus::Active)?;
                return Err(e);
            }
        };
        self.registry.set_learner_status(learner_id, LearnerStatus::Active)?;

        let session = TrainingSession {
            session_id: Uuid::new_v4().to_string(),
            timestamp: update.timestamp,
            epochs: self.manager.config().local_epochs,
            samples: update.num_samples,
            metrics: update.training_metrics,
            contributed_to_federation: false,
            federated_update_id: None,
        };
        self.registry.record_training_session(learner_id, session.clone())?;
        Ok(session)
    }

    /// Create a pending job when enough learners are eligible.
    pub fn schedule_aggregation(&self) -> Option<String> {
        let eligible = self
            .registry
            .eligible_learners(self.config.eligibility_window_days);
        if eligible.len() < self.config.minimum_learners {
            info!(
                "Not scheduling aggregation: {} eligible learner(s), {} required",
                eligible.len(),
                self.config.minimum_learners
            );
            return None;
        }

        let job = AggregationJob::new(eligible);
        let job_id = job.job_id.clone();
        info!(
            "Scheduled aggregation job {} for {} learner(s)",
            job_id,
            job.eligible_learners.len()
        );
        self.jobs.insert(job_id.clone(), job);
        Some(job_id)
    }

    /// Run a pending job to completion. Job-level failures are reported
    /// through the returned job's status, not as `Err`.
    #[instrument(skip(self))]
    pub async fn execute_aggregation(&self, job_id: &str) -> CoreResult<AggregationJob> {
        let _exclusive = self.execution_lock.lock().await;

        let mut job = self
            .jobs
            .get(job_id)
            .map(|j| j.clone())
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
        job.transition(JobStatus::Running)?;
        self.jobs.insert(job_id.to_string(), job.clone());

        match self.run_job(&mut job) {
            Ok(results) => {
                job.aggregation_results = Some(results);
                job.transition(JobStatus::Completed)?;
                info!("Aggregation job {} completed", job_id);
            }
            Err(e) => {
                error!("Aggregation job {} failed: {}", job_id, e);
                job.fail(e.to_string())?;
            }
        }

        self.jobs.insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    fn collect_updates(&self, job: &AggregationJob, main: &Model) -> Vec<FederatedUpdate> {
        let mut updates = Vec::with_capacity(job.eligible_learners.len());
        for learner_id in &job.eligible_learners {
            match self.learner_update(learner_id, main) {
                Ok(update) => updates.push(update),
                Err(e) => warn!("Skipping learner {}: {}", learner_id, e),
            }
        }
        updates
    }

    fn learner_update(&self, learner_id: &str, main: &Model) -> CoreResult<FederatedUpdate> {
        let instance = self
            .registry
            .get_learner_model(learner_id)
            .ok_or_else(|| CoreError::NotFound(format!("learner model {learner_id}")))?;
        let session = instance
            .training_history
            .last()
            .ok_or_else(|| CoreError::NotFound(format!("training session for {learner_id}")))?;

        let (learner_model, _) = self.cloner.load_clone(&ModelArtifact::at(&instance.model_path))?;
        let weight_deltas = self.cloner.extract_weight_deltas(main, &learner_model)?;

        Ok(FederatedUpdate {
            learner_id: learner_id.to_string(),
            weight_deltas,
            num_samples: session.samples,
            training_metrics: session.metrics,
            timestamp: session.timestamp,
        })
    }

    fn run_job(&self, job: &mut AggregationJob) -> CoreResult<AggregationResults> {
        let main = self.main_artifact();
        let (main_model, _) = main.load()?;

        let updates = self.collect_updates(job, &main_model);
        job.contributing_learners = updates.iter().map(|u| u.learner_id.clone()).collect();
        if updates.len() < self.config.minimum_learners {
            return Err(CoreError::AggregationQuorumNotMet {
                required: self.config.minimum_learners,
                available: updates.len(),
            });
        }

        let federation = self.manager.config();
        let aggregated = self.manager.aggregate_updates(&updates, federation.strategy)?;

        let evaluation_data = self.evaluation_data.read().clone();
        let baseline = self.manager.evaluate(&main_model, &evaluation_data)?;

        let snapshot = main.snapshot()?;
        let metadata =
            self.manager
                .update_main_model(&main, &aggregated, federation.learning_rate, updates.len())?;

        let committed = (|| -> CoreResult<(AggregationResults, Model)> {
            let (updated_model, _) = main.load()?;
            let updated = self.manager.evaluate(&updated_model, &evaluation_data)?;
            let performance_improvement = updated.accuracy - baseline.accuracy;

            let total_samples: usize = updates.iter().map(|u| u.num_samples).sum();
            let privacy_budget = self.manager.privacy_budget(total_samples)?;

            let latest = self
                .registry
                .latest_main_version()
                .ok_or_else(|| {
                    CoreError::NotFound("no shared model has been registered".to_string())
                })?;
            self.registry.record_federated_update(
                &latest.version,
                FederatedUpdateRecord {
                    update_id: Uuid::new_v4().to_string(),
                    timestamp: Utc::now(),
                    contributing_learners: job.contributing_learners.clone(),
                    aggregation_strategy: federation.strategy,
                    performance_improvement,
                    privacy_budget,
                },
            )?;

            let results = AggregationResults {
                performance_improvement,
                privacy_budget,
                error: None,
                new_version: Some(metadata.version.clone()),
                baseline: Some(ModelMetrics {
                    loss: baseline.loss,
                    accuracy: baseline.accuracy,
                }),
                updated: Some(ModelMetrics {
                    loss: updated.loss,
                    accuracy: updated.accuracy,
                }),
            };
            Ok((results, updated_model))
        })();

        let (results, updated_model) = match committed {
            Ok(committed) => committed,
            Err(e) => {
                if let Err(restore_err) = main.restore(&snapshot) {
                    error!(
                        "Failed to roll back shared model after aggregation error: {}",
                        restore_err
                    );
                } else {
                    warn!("Rolled shared model back after aggregation error");
                }
                return Err(e);
            }
        };

        if self.config.push_down_updates {
            self.push_down(&job.contributing_learners, &updated_model);
        }
        Ok(results)
    }

    fn push_down(&self, learners: &[String], model: &Model) {
        let weights = model.weights();
        for learner_id in learners {
            let Some(instance) = self.registry.get_learner_model(learner_id) else {
                continue;
            };
            match self
                .cloner
                .update_clone_weights(&ModelArtifact::at(&instance.model_path), &weights)
            {
                Ok(count) => debug!("Pushed shared weights to {} (update {})", learner_id, count),
                Err(e) => warn!("Failed to push shared weights to {}: {}", learner_id, e),
            }
        }
    }

    pub fn get_job(&self, job_id: &str) -> Option<AggregationJob> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Oldest first.
    pub fn list_jobs(&self) -> Vec<AggregationJob> {
        let mut jobs: Vec<AggregationJob> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.scheduled_at);
        jobs
    }

    /// Schedule and, if a job was created, execute it.
    pub async fn run_once(&self) -> CoreResult<Option<AggregationJob>> {
        match self.schedule_aggregation() {
            Some(job_id) => self.execute_aggregation(&job_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Call [`run_once`](Self::run_once) every `interval` until the handle is
    /// stopped. The first run happens one interval after start.
    pub fn start_scheduler(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!("Scheduled aggregation failed: {}", e);
                        }
                    }
                }
            }
            debug!("Aggregation scheduler stopped");
        });
        info!("Aggregation scheduler started (every {:?})", interval);
        SchedulerHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

pub struct SchedulerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Aggregation scheduler task ended abnormally: {}", e);
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
