//! Command-line interface definitions using clap derive API, and the
//! command implementations behind them.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::aggregation::{FederatedAggregationService, JobStatus};
use crate::agent::{Agent, AgentStateStore, EchoBehavior, InMemoryStateStore, SledStateStore};
use crate::bus::{InMemoryBus, MessageBus};
use crate::federated::FederatedLearningManager;
use crate::model::{Batch, LinearTrainer, Model};
use crate::orchestrator::{load_plan, Orchestrator};
use crate::registry::{ModelMetrics, ModelRegistry};
use crate::settings::Settings;

/// Adaptive learning core CLI
#[derive(Parser)]
#[command(name = "alc-cli")]
#[command(about = "Multi-agent orchestration and federated learning core")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute an orchestration plan with echo agents
    Run {
        /// Path to the TOML plan file
        #[arg(short, long)]
        plan: PathBuf,
        /// Learner the agents act for
        #[arg(long, default_value = "cli")]
        learner: String,
    },
    /// Create and register the initial shared model
    Init {
        /// Layer sizes, input first
        #[arg(long, value_delimiter = ',', default_value = "4,8,2")]
        layers: Vec<usize>,
        #[arg(long, default_value = "1.0.0")]
        version: String,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Clone the latest shared model for a learner
    Enroll {
        learner: String,
    },
    /// Train a learner's clone on local data and record the session
    Train {
        learner: String,
        /// JSON file holding training batches
        #[arg(long)]
        data: PathBuf,
    },
    /// Schedule and execute one aggregation job
    Aggregate {
        /// JSON file holding held-out batches
        #[arg(long)]
        evaluation_data: Option<PathBuf>,
    },
    /// Run aggregation periodically until interrupted
    Schedule {
        #[arg(long)]
        evaluation_data: Option<PathBuf>,
    },
    /// Print registry statistics
    Stats,
}

pub async fn execute(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Commands::Run { plan, learner } => run_plan(&plan, &learner, &settings).await,
        Commands::Init {
            layers,
            version,
            seed,
        } => init_model(&layers, &version, seed, &settings),
        Commands::Enroll { learner } => enroll(&learner, &settings),
        Commands::Train { learner, data } => train(&learner, &data, &settings).await,
        Commands::Aggregate { evaluation_data } => {
            aggregate(evaluation_data.as_deref(), &settings).await
        }
        Commands::Schedule { evaluation_data } => {
            schedule(evaluation_data.as_deref(), &settings).await
        }
        Commands::Stats => stats(&settings),
    }
}

fn state_store(settings: &Settings) -> Result<Arc<dyn AgentStateStore>> {
    Ok(match &settings.agents.state_path {
        Some(path) => Arc::new(
            SledStateStore::open(path)
                .with_context(|| format!("Failed to open agent state store at {:?}", path))?,
        ),
        None => Arc::new(InMemoryStateStore::new()),
    })
}

async fn run_plan(path: &Path, learner: &str, settings: &Settings) -> Result<()> {
    info!("Running orchestration plan from {:?}", path);
    let plan = load_plan(path).context("Failed to load orchestration plan")?;

    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let store = state_store(settings)?;
    let orchestrator = Orchestrator::new(settings.orchestrator.clone(), bus.clone());
    let session_id = uuid::Uuid::new_v4().to_string();

    for agent_id in plan.agent_ids() {
        let agent = Arc::new(Agent::new(
            agent_id.clone(),
            learner,
            session_id.clone(),
            Arc::new(EchoBehavior::new()),
            bus.clone(),
            store.clone(),
            settings.agents.clone(),
        ));
        orchestrator
            .register_agent(agent)
            .await
            .with_context(|| format!("Failed to register agent {agent_id}"))?;
    }

    let outcome = orchestrator.orchestrate(&plan).await;
    if let Err(e) = orchestrator.shutdown_all().await {
        warn!("Agent shutdown reported an error: {}", e);
    }
    let result = outcome.context("Plan execution failed")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.success {
        Ok(())
    } else {
        Err(anyhow!(
            "Plan {} finished with {} failed step(s)",
            result.plan_id,
            result.errors.len()
        ))
    }
}

fn build_service(settings: &Settings) -> Result<FederatedAggregationService> {
    let registry = ModelRegistry::open(&settings.registry.directory)
        .with_context(|| format!("Failed to open registry at {:?}", settings.registry.directory))?;
    let trainer = Arc::new(LinearTrainer::new(settings.federation.local_learning_rate as f32));
    let manager = FederatedLearningManager::new(settings.federation.clone(), trainer)
        .context("Invalid federation settings")?;

    Ok(FederatedAggregationService::new(
        Arc::new(registry),
        Arc::new(manager),
        settings.models.clone(),
        settings.aggregation.clone(),
    ))
}

fn load_batches(path: &Path) -> Result<Vec<Batch>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batches: {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse batches: {:?}", path))
}

fn init_model(layers: &[usize], version: &str, seed: u64, settings: &Settings) -> Result<()> {
    let service = build_service(settings)?;
    let model = Model::dense("dense", layers, seed).context("Invalid layer sizes")?;
    let entry = service
        .bootstrap_main_model(&model, version, ModelMetrics::default())
        .context("Failed to register shared model")?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

fn enroll(learner: &str, settings: &Settings) -> Result<()> {
    let service = build_service(settings)?;
    let instance = service
        .enroll_learner(learner)
        .with_context(|| format!("Failed to enroll learner {learner}"))?;
    println!("{}", serde_json::to_string_pretty(&instance)?);
    Ok(())
}

async fn train(learner: &str, data: &Path, settings: &Settings) -> Result<()> {
    let service = build_service(settings)?;
    let batches = load_batches(data)?;
    let session = service
        .record_local_training(learner, &batches)
        .await
        .with_context(|| format!("Local training failed for {learner}"))?;
    info!("Recorded training session {} for {}", session.session_id, learner);
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

async fn aggregate(evaluation_data: Option<&Path>, settings: &Settings) -> Result<()> {
    let service = build_service(settings)?;
    if let Some(path) = evaluation_data {
        service.set_evaluation_data(load_batches(path)?);
    }

    match service.run_once().await? {
        Some(job) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.status == JobStatus::Failed {
                return Err(anyhow!("Aggregation job {} failed", job.job_id));
            }
        }
        None => println!("No aggregation scheduled: not enough eligible learners"),
    }
    Ok(())
}

async fn schedule(evaluation_data: Option<&Path>, settings: &Settings) -> Result<()> {
    let service = Arc::new(build_service(settings)?);
    if let Some(path) = evaluation_data {
        service.set_evaluation_data(load_batches(path)?);
    }

    let interval = Duration::from_secs(settings.aggregation.schedule_interval_seconds);
    let handle = service.clone().start_scheduler(interval);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, stopping scheduler");
    handle.stop().await;
    Ok(())
}

fn stats(settings: &Settings) -> Result<()> {
    let registry = ModelRegistry::open(&settings.registry.directory)
        .with_context(|| format!("Failed to open registry at {:?}", settings.registry.directory))?;
    println!("{}", serde_json::to_string_pretty(&registry.statistics())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from(["alc-cli", "run", "--plan", "plan.toml"]).unwrap();
        match cli.command {
            Commands::Run { plan, learner } => {
                assert_eq!(plan, PathBuf::from("plan.toml"));
                assert_eq!(learner, "cli");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_init_layers() {
        let cli = Cli::try_parse_from(["alc-cli", "init", "--layers", "3,5,1"]).unwrap();
        match cli.command {
            Commands::Init { layers, version, .. } => {
                assert_eq!(layers, vec![3, 5, 1]);
                assert_eq!(version, "1.0.0");
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn test_parse_enroll_and_train() {
        let cli = Cli::try_parse_from(["alc-cli", "enroll", "alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Enroll { learner } if learner == "alice"));

        let cli =
            Cli::try_parse_from(["alc-cli", "train", "alice", "--data", "batches.json"]).unwrap();
        match cli.command {
            Commands::Train { learner, data } => {
                assert_eq!(learner, "alice");
                assert_eq!(data, PathBuf::from("batches.json"));
            }
            _ => panic!("expected train"),
        }

        assert!(Cli::try_parse_from(["alc-cli", "train", "alice"]).is_err());
    }

    #[test]
    fn test_load_batches_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batches.json");
        std::fs::write(&path, r#"[{"inputs": [[0.0]], "targets": [[1.0]]}]"#).unwrap();
        assert_eq!(load_batches(&path).unwrap().len(), 1);

        let err = load_batches(&dir.path().join("missing.json")).unwrap_err();
        assert!(format!("{err:#}").contains("missing.json"));
    }
}
