//! Durable catalog of shared-model versions and learner model instances.
//!
//! Two JSON documents live in the registry directory: `main_models.json`
//! (keyed by version) and `learner_models.json` (keyed by learner id). Every
//! mutation is applied to a copy, written atomically, and only then swapped
//! into memory, so the in-memory and on-disk views never diverge.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, instrument};

use crate::error::{CoreError, CoreResult};
use crate::federated::AggregationStrategy;
use crate::model::ArchitectureStats;

pub const MAIN_MODELS_FILE: &str = "main_models.json";
pub const LEARNER_MODELS_FILE: &str = "learner_models.json";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FederatedUpdateRecord {
    pub update_id: String,
    pub timestamp: DateTime<Utc>,
    pub contributing_learners: Vec<String>,
    pub aggregation_strategy: AggregationStrategy,
    pub performance_improvement: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_budget: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MainModelVersion {
    pub version: String,
    pub model_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub training_metrics: ModelMetrics,
    pub architecture: ArchitectureStats,
    #[serde(default)]
    pub federated_updates: Vec<FederatedUpdateRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LearnerStatus {
    Active,
    Archived,
    Training,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSession {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub epochs: usize,
    pub samples: usize,
    pub metrics: ModelMetrics,
    #[serde(default)]
    pub contributed_to_federation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_update_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub accuracy: f64,
    pub loss: f64,
    pub improvement: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LearnerModelInstance {
    pub learner_id: String,
    pub model_path: PathBuf,
    pub source_version: String,
    pub cloned_at: DateTime<Utc>,
    #[serde(default)]
    pub last_training_session: Option<DateTime<Utc>>,
    #[serde(default)]
    pub training_history: Vec<TrainingSession>,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
    pub status: LearnerStatus,
}

impl LearnerModelInstance {
    pub fn new(
        learner_id: impl Into<String>,
        model_path: PathBuf,
        source_version: impl Into<String>,
    ) -> Self {
        Self {
            learner_id: learner_id.into(),
            model_path,
            source_version: source_version.into(),
            cloned_at: Utc::now(),
            last_training_session: None,
            training_history: Vec::new(),
            performance_metrics: PerformanceMetrics::default(),
            status: LearnerStatus::Active,
        }
    }

    fn recompute_performance(&mut self) {
        let history = &self.training_history;
        if let (Some(first), Some(last)) = (history.first(), history.last()) {
            self.performance_metrics = PerformanceMetrics {
                accuracy: last.metrics.accuracy,
                loss: last.metrics.loss,
                improvement: last.metrics.accuracy - first.metrics.accuracy,
            };
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    pub main_versions: usize,
    pub learner_models: usize,
    pub active_learners: usize,
    pub total_federated_updates: usize,
    pub average_active_accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
}

pub struct ModelRegistry {
    directory: PathBuf,
    main_models: RwLock<BTreeMap<String, MainModelVersion>>,
    learner_models: RwLock<BTreeMap<String, LearnerModelInstance>>,
}

impl ModelRegistry {
    /// Open (or create) the registry in `directory`, loading both documents.
    pub fn open(directory: impl AsRef<Path>) -> CoreResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| CoreError::model_io(&directory, e))?;

        let main_models: BTreeMap<String, MainModelVersion> =
            read_document(&directory.join(MAIN_MODELS_FILE))?;
        let learner_models: BTreeMap<String, LearnerModelInstance> =
            read_document(&directory.join(LEARNER_MODELS_FILE))?;
        info!(
            "Model registry loaded: {} main versions, {} learner models",
            main_models.len(),
            learner_models.len()
        );

        Ok(Self {
            directory,
            main_models: RwLock::new(main_models),
            learner_models: RwLock::new(learner_models),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn mutate_main<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, MainModelVersion>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let mut guard = self.main_models.write();
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        write_document(&self.directory, MAIN_MODELS_FILE, &draft)?;
        *guard = draft;
        Ok(out)
    }

    fn mutate_learners<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, LearnerModelInstance>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let mut guard = self.learner_models.write();
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        write_document(&self.directory, LEARNER_MODELS_FILE, &draft)?;
        *guard = draft;
        Ok(out)
    }

    /// Versions are immutable once registered.
    pub fn register_main_version(&self, version: MainModelVersion) -> CoreResult<()> {
        let key = version.version.clone();
        self.mutate_main(|doc| {
            if doc.contains_key(&key) {
                return Err(CoreError::AlreadyExists(format!("main model version {key}")));
            }
            doc.insert(key.clone(), version);
            Ok(())
        })?;
        info!("Registered main model version {}", key);
        Ok(())
    }

    /// One instance per learner; re-registering replaces the previous clone.
    pub fn register_learner_model(&self, instance: LearnerModelInstance) -> CoreResult<()> {
        let learner_id = instance.learner_id.clone();
        self.mutate_learners(|doc| {
            doc.insert(learner_id.clone(), instance);
            Ok(())
        })?;
        info!("Registered learner model for {}", learner_id);
        Ok(())
    }

    /// Append a training session and refresh the learner's performance metrics.
    pub fn record_training_session(
        &self,
        learner_id: &str,
        session: TrainingSession,
    ) -> CoreResult<()> {
        self.mutate_learners(|doc| {
            let instance = doc
                .get_mut(learner_id)
                .ok_or_else(|| CoreError::NotFound(format!("learner model {learner_id}")))?;
            instance.last_training_session = Some(session.timestamp);
            instance.training_history.push(session);
            instance.recompute_performance();
            Ok(())
        })?;
        debug!("Recorded training session for {}", learner_id);
        Ok(())
    }

    pub fn set_learner_status(&self, learner_id: &str, status: LearnerStatus) -> CoreResult<()> {
        self.mutate_learners(|doc| {
            let instance = doc
                .get_mut(learner_id)
                .ok_or_else(|| CoreError::NotFound(format!("learner model {learner_id}")))?;
            instance.status = status;
            Ok(())
        })
    }

    /// Append `record` to `version` and mark every contributor's latest
    /// training session as contributed.
    ///
    /// Both documents change together: if the learner document cannot be
    /// written, the previous main document is written back and neither
    /// in-memory view changes.
    #[instrument(skip(self, record), fields(update_id = %record.update_id))]
    pub fn record_federated_update(
        &self,
        version: &str,
        record: FederatedUpdateRecord,
    ) -> CoreResult<()> {
        let contributors = record.contributing_learners.clone();
        let update_id = record.update_id.clone();

        let mut main_guard = self.main_models.write();
        let mut learner_guard = self.learner_models.write();

        let mut main_draft = main_guard.clone();
        main_draft
            .get_mut(version)
            .ok_or_else(|| CoreError::NotFound(format!("main model version {version}")))?
            .federated_updates
            .push(record);

        let mut learner_draft = learner_guard.clone();
        for learner_id in &contributors {
            if let Some(session) = learner_draft
                .get_mut(learner_id)
                .and_then(|instance| instance.training_history.last_mut())
            {
                session.contributed_to_federation = true;
                session.federated_update_id = Some(update_id.clone());
            }
        }

        write_document(&self.directory, MAIN_MODELS_FILE, &main_draft)?;
        if let Err(e) = write_document(&self.directory, LEARNER_MODELS_FILE, &learner_draft) {
            if let Err(restore) = write_document(&self.directory, MAIN_MODELS_FILE, &*main_guard) {
                error!(
                    "Failed to restore {} after learner write error: {}",
                    MAIN_MODELS_FILE, restore
                );
            }
            return Err(e);
        }
        *main_guard = main_draft;
        *learner_guard = learner_draft;

        info!(
            "Recorded federated update {} on version {} ({} contributors)",
            update_id,
            version,
            contributors.len()
        );
        Ok(())
    }

    /// The most recently created main version.
    pub fn latest_main_version(&self) -> Option<MainModelVersion> {
        self.main_models
            .read()
            .values()
            .max_by_key(|v| v.created_at)
            .cloned()
    }

    pub fn get_main_model(&self, version: &str) -> Option<MainModelVersion> {
        self.main_models.read().get(version).cloned()
    }

    /// Oldest first.
    pub fn list_main_versions(&self) -> Vec<MainModelVersion> {
        let mut versions: Vec<MainModelVersion> =
            self.main_models.read().values().cloned().collect();
        versions.sort_by_key(|v| v.created_at);
        versions
    }

    pub fn get_learner_model(&self, learner_id: &str) -> Option<LearnerModelInstance> {
        self.learner_models.read().get(learner_id).cloned()
    }

    pub fn list_learner_models(&self) -> Vec<LearnerModelInstance> {
        self.learner_models.read().values().cloned().collect()
    }

    /// Learners that are active, trained within the last `since_days`, and
    /// whose latest session has not yet been folded into a federated update.
    pub fn eligible_learners(&self, since_days: i64) -> Vec<String> {
        self.eligible_learners_at(Utc::now(), since_days)
    }

    /// Windows reaching past the representable range include every session.
    pub fn eligible_learners_at(&self, now: DateTime<Utc>, since_days: i64) -> Vec<String> {
        let cutoff = ChronoDuration::try_days(since_days)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.learner_models
            .read()
            .values()
            .filter(|instance| instance.status == LearnerStatus::Active)
            .filter(|instance| {
                instance
                    .training_history
                    .last()
                    .is_some_and(|s| s.timestamp >= cutoff && !s.contributed_to_federation)
            })
            .map(|instance| instance.learner_id.clone())
            .collect()
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let main = self.main_models.read();
        let learners = self.learner_models.read();

        let active: Vec<&LearnerModelInstance> = learners
            .values()
            .filter(|l| l.status == LearnerStatus::Active)
            .collect();
        let average_active_accuracy = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|l| l.performance_metrics.accuracy).sum::<f64>() / active.len() as f64
        };

        RegistryStatistics {
            main_versions: main.len(),
            learner_models: learners.len(),
            active_learners: active.len(),
            total_federated_updates: main.values().map(|v| v.federated_updates.len()).sum(),
            average_active_accuracy,
            latest_version: main
                .values()
                .max_by_key(|v| v.created_at)
                .map(|v| v.version.clone()),
        }
    }
}

fn read_document<T: DeserializeOwned + Default>(path: &Path) -> CoreResult<T> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| CoreError::model_io(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(CoreError::model_io(path, e)),
    }
}

fn write_document<T: Serialize>(directory: &Path, file: &str, document: &T) -> CoreResult<()> {
    let path = directory.join(file);
    let bytes = serde_json::to_vec_pretty(document)?;
    let mut tmp = NamedTempFile::new_in(directory).map_err(|e| CoreError::model_io(&path, e))?;
    tmp.write_all(&bytes).map_err(|e| CoreError::model_io(&path, e))?;
    tmp.as_file().sync_all().map_err(|e| CoreError::model_io(&path, e))?;
    tmp.persist(&path).map_err(|e| CoreError::model_io(&path, e.error))?;
    Ok(())
}
