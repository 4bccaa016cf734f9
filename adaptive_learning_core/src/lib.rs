//! Adaptive Learning Core
//!
//! Agent lifecycle and memory, plan orchestration across agents, and a
//! federated-learning pipeline (model registry, learner clones, local
//! training, aggregation) for an adaptive learning platform.

pub mod agent;
pub mod aggregation;
pub mod bus;
pub mod cli;
pub mod cloner;
pub mod error;
pub mod federated;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod settings;
pub mod telemetry;

pub use agent::{Agent, AgentBehavior};
pub use aggregation::{AggregationJob, FederatedAggregationService, JobStatus};
pub use error::{CoreError, CoreResult};
pub use federated::{AggregationStrategy, FederatedLearningManager};
pub use orchestrator::Orchestrator;
pub use registry::ModelRegistry;
