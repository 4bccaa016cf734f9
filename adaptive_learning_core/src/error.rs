//! Error taxonomy shared by the agent framework, the orchestrator and the
//! federated-learning pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("coordination with agent '{target}' timed out after {timeout_ms}ms")]
    CoordinationTimeout { target: String, timeout_ms: u64 },

    #[error("agent '{0}' does not have coordination enabled")]
    CoordinationDisabled(String),

    #[error("agent '{0}' is shutting down")]
    ShuttingDown(String),

    #[error("step '{step_id}' timed out waiting for dependencies {missing:?}")]
    DependencyWaitTimeout { step_id: String, missing: Vec<String> },

    #[error("step '{step_id}' failed after {attempts} attempt(s): {message}")]
    StepExecutionFailure {
        step_id: String,
        attempts: u32,
        message: String,
    },

    #[error("plan '{plan_id}' exceeded its deadline of {timeout_ms}ms")]
    PlanTimeout { plan_id: String, timeout_ms: u64 },

    #[error("aggregation requires at least {required} learners, got {available}")]
    AggregationQuorumNotMet { required: usize, available: usize },

    #[error("model artifact error at {path:?}: {message}")]
    ModelIo { path: PathBuf, message: String },

    #[error("agent '{agent_id}' failed to process input: {message}")]
    BehaviorFailure { agent_id: String, message: String },

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{0}' is already registered")]
    AgentAlreadyRegistered(String),

    #[error("agent '{agent_id}' failed to initialize during {stage}: {message}")]
    AgentInitialization {
        agent_id: String,
        stage: &'static str,
        message: String,
    },

    #[error("unknown aggregation job '{0}'")]
    UnknownJob(String),

    #[error("invalid job transition from {from} to {to}")]
    InvalidJobTransition { from: String, to: String },

    #[error("learner '{0}' already has a training run in progress")]
    TrainingInProgress(String),

    #[error("learner '{0}' is archived")]
    LearnerArchived(String),

    #[error("tensor shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid privacy parameters: {0}")]
    InvalidPrivacyParameters(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("message bus error: {0}")]
    Bus(String),

    #[error("agent state store error: {0}")]
    StateStore(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn model_io(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::ModelIo {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// True for the timeout family, which callers usually want to report
    /// differently from hard failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CoordinationTimeout { .. }
                | Self::DependencyWaitTimeout { .. }
                | Self::PlanTimeout { .. }
        )
    }
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        Self::StateStore(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
