//! Configuration management with layered file and environment variable support.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::federated::AggregationStrategy;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
        }
    }
}

/// Agent runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub max_short_term_items: usize,
    pub max_long_term_items: usize,
    pub max_episodes: usize,
    pub consolidation_threshold: f64,
    pub heartbeat_interval_ms: u64,
    pub coordination_timeout_ms: u64,
    pub enable_coordination: bool,
    pub subscribe_broadcasts: bool,
    pub state_path: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_short_term_items: 50,
            max_long_term_items: 500,
            max_episodes: 100,
            consolidation_threshold: 0.7,
            heartbeat_interval_ms: 30_000,
            coordination_timeout_ms: 5_000,
            enable_coordination: true,
            subscribe_broadcasts: true,
            state_path: None,
        }
    }
}

impl AgentSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination_timeout_ms)
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub default_dependency_timeout_ms: u64,
    pub dependency_poll_interval_ms: u64,
    pub audit_log_capacity: usize,
    pub event_channel_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_dependency_timeout_ms: 30_000,
            dependency_poll_interval_ms: 100,
            audit_log_capacity: 10_000,
            event_channel_capacity: 1_024,
        }
    }
}

impl OrchestratorConfig {
    pub fn default_dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.default_dependency_timeout_ms)
    }

    pub fn dependency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_interval_ms)
    }
}

/// Registry document location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub directory: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/registry"),
        }
    }
}

/// Model artifact locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub main_model_dir: PathBuf,
    pub learner_models_dir: PathBuf,
    pub frozen_layers: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            main_model_dir: PathBuf::from("data/models/main"),
            learner_models_dir: PathBuf::from("data/models/learners"),
            frozen_layers: Vec::new(),
        }
    }
}

impl ModelsConfig {
    pub fn learner_dir(&self, learner_id: &str) -> PathBuf {
        self.learner_models_dir.join(learner_id)
    }
}

/// Federated learning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub strategy: AggregationStrategy,
    pub learning_rate: f64,
    pub local_epochs: usize,
    pub local_learning_rate: f64,
    pub enable_differential_privacy: bool,
    pub clip_norm: Option<f64>,
    pub noise_multiplier: Option<f64>,
    pub dp_delta: f64,
    pub batch_size: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::Weighted,
            learning_rate: 1.0,
            local_epochs: 5,
            local_learning_rate: 0.01,
            enable_differential_privacy: false,
            clip_norm: Some(1.0),
            noise_multiplier: None,
            dp_delta: 1e-5,
            batch_size: 32,
        }
    }
}

/// Aggregation scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub minimum_learners: usize,
    pub eligibility_window_days: i64,
    pub schedule_interval_seconds: u64,
    pub push_down_updates: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            minimum_learners: 3,
            eligibility_window_days: 7,
            schedule_interval_seconds: 86_400,
            push_down_updates: false,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub agents: AgentSettings,
    pub orchestrator: OrchestratorConfig,
    pub registry: RegistryConfig,
    pub models: ModelsConfig,
    pub federation: FederationConfig,
    pub aggregation: AggregationConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, an optional local file and
    /// `ALC__`-prefixed environment variables, in that order.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("alc").required(false))
            .add_source(
                Environment::with_prefix("ALC")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models.frozen_layers")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.agents.max_short_term_items == 0 {
            return Err(anyhow!("agents.max_short_term_items cannot be 0"));
        }
        if self.agents.max_long_term_items == 0 {
            return Err(anyhow!("agents.max_long_term_items cannot be 0"));
        }
        if !(0.0..=1.0).contains(&self.agents.consolidation_threshold) {
            return Err(anyhow!(
                "agents.consolidation_threshold must be within [0, 1], got {}",
                self.agents.consolidation_threshold
            ));
        }
        if self.agents.heartbeat_interval_ms == 0 {
            return Err(anyhow!("agents.heartbeat_interval_ms cannot be 0"));
        }

        if self.orchestrator.dependency_poll_interval_ms == 0 {
            return Err(anyhow!("orchestrator.dependency_poll_interval_ms cannot be 0"));
        }

        if self.aggregation.minimum_learners == 0 {
            return Err(anyhow!("aggregation.minimum_learners cannot be 0"));
        }
        if self.aggregation.eligibility_window_days <= 0 {
            return Err(anyhow!("aggregation.eligibility_window_days must be positive"));
        }
        if chrono::Duration::try_days(self.aggregation.eligibility_window_days).is_none() {
            return Err(anyhow!(
                "aggregation.eligibility_window_days is out of range: {}",
                self.aggregation.eligibility_window_days
            ));
        }

        if self.federation.learning_rate <= 0.0 {
            return Err(anyhow!("federation.learning_rate must be positive"));
        }
        if self.federation.batch_size == 0 {
            return Err(anyhow!("federation.batch_size cannot be 0"));
        }
        if self.federation.enable_differential_privacy
            && self.federation.noise_multiplier.map_or(true, |n| n <= 0.0)
        {
            // Soft: training proceeds without noise.
            warn!("Differential privacy enabled without a positive noise_multiplier");
        }

        if !self.models.main_model_dir.exists() {
            warn!("Main model directory does not exist: {:?}", self.models.main_model_dir);
        }

        Ok(())
    }

    /// Get a configuration value by JSON pointer (e.g. "/aggregation/minimum_learners")
    pub fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = serde_json::to_value(self)?;
        let value = value
            .pointer(path)
            .ok_or_else(|| anyhow!("Configuration path not found: {}", path))?;

        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.agents.coordination_timeout(), Duration::from_secs(5));
        assert_eq!(
            settings.orchestrator.default_dependency_timeout(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.agents.consolidation_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.aggregation.minimum_learners = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.federation.learning_rate = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.aggregation.eligibility_window_days = 200_000_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_pointer_lookup() {
        let settings = Settings::default();
        let min: usize = settings.get("/aggregation/minimum_learners").unwrap();
        assert_eq!(min, 3);
        assert!(settings.get::<usize>("/nope").is_err());
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let parsed: Settings = toml::from_str(include_str!("../config.toml")).unwrap();
        assert_eq!(parsed.aggregation.minimum_learners, 3);
        assert_eq!(parsed.federation.strategy, AggregationStrategy::Weighted);
    }
}
