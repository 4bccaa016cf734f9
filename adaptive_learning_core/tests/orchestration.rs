//! End-to-end orchestration tests: agents registered on a shared in-process
//! bus, plans executed through the orchestrator.

use adaptive_learning_core::{
    agent::{Agent, AgentBehavior, AgentInput, AgentResponse, EchoBehavior, InMemoryStateStore},
    bus::{InMemoryBus, MessageBus, EXECUTE_STEP_QUEUE},
    orchestrator::{load_plan, OrchestrationPlan, Orchestrator, RetryPolicy, Step},
    settings::{AgentSettings, OrchestratorConfig},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing_test::traced_test;

struct FailsOnce {
    calls: AtomicU32,
}

#[async_trait]
impl AgentBehavior for FailsOnce {
    fn agent_type(&self) -> &str {
        "fails-once"
    }

    async fn process_input(&self, _agent: &Agent, input: AgentInput) -> Result<AgentResponse> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow!("first call always fails"));
        }
        Ok(AgentResponse {
            action: input.action,
            confidence: 0.9,
            reasoning: "second time lucky".to_string(),
            data: input.data,
        })
    }

    async fn fetch_learner_from_db(&self, learner_id: &str) -> Result<Value> {
        Ok(json!({ "learnerId": learner_id }))
    }
}

fn agent(id: &str, behavior: Arc<dyn AgentBehavior>, bus: &Arc<dyn MessageBus>) -> Arc<Agent> {
    Arc::new(Agent::new(
        id,
        "learner-1",
        "session-1",
        behavior,
        bus.clone(),
        Arc::new(InMemoryStateStore::new()),
        AgentSettings::default(),
    ))
}

#[tokio::test]
#[traced_test]
async fn test_retry_then_success_reports_two_attempts() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), bus.clone());
    let flaky: Arc<dyn AgentBehavior> = Arc::new(FailsOnce {
        calls: AtomicU32::new(0),
    });
    orchestrator.register_agent(agent("tutor", flaky, &bus)).await.unwrap();

    let plan = OrchestrationPlan::sequential(
        "retry",
        vec![Step::new("explain", "tutor", "explain")
            .with_input(json!({ "topic": "fractions" }))
            .with_retry(RetryPolicy::new(2, 0))],
    );
    let result = orchestrator.orchestrate(&plan).await.unwrap();

    assert!(result.success);
    assert!(result.errors.is_empty());
    assert_eq!(result.attempts["explain"], 2);
    assert_eq!(result.results["explain"].data["topic"], "fractions");
}

#[tokio::test]
#[traced_test]
async fn test_plan_file_with_dependencies() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
id = "lesson"
parallel = true

[[steps]]
id = "assess"
agent_id = "assessor"
action = "assess"

[[steps]]
id = "plan"
agent_id = "planner"
action = "plan"
dependencies = ["assess"]
"#
    )
    .unwrap();
    let plan = load_plan(file.path()).unwrap();

    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), bus.clone());
    for id in plan.agent_ids() {
        let echo: Arc<dyn AgentBehavior> = Arc::new(EchoBehavior::new());
        orchestrator.register_agent(agent(&id, echo, &bus)).await.unwrap();
    }

    let result = orchestrator.orchestrate(&plan).await.unwrap();
    assert!(result.success);
    assert_eq!(result.results.len(), 2);

    // Both dispatches were queued for audit.
    assert_eq!(bus.queue_len(EXECUTE_STEP_QUEUE).await.unwrap(), 2);
    let audit = orchestrator.audit_log();
    let assess = audit.iter().position(|r| r.step_id == "assess").unwrap();
    let planned = audit.iter().position(|r| r.step_id == "plan").unwrap();
    assert!(assess < planned);

    orchestrator.shutdown_all().await.unwrap();
    assert!(orchestrator.list_agents().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_agents_coordinate_over_the_bus() {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let orchestrator = Orchestrator::new(OrchestratorConfig::default(), bus.clone());
    let a: Arc<dyn AgentBehavior> = Arc::new(EchoBehavior::new());
    let b: Arc<dyn AgentBehavior> = Arc::new(EchoBehavior::new());
    orchestrator.register_agent(agent("a", a, &bus)).await.unwrap();
    orchestrator.register_agent(agent("b", b, &bus)).await.unwrap();

    let a = orchestrator.agent("a").unwrap();
    let reply = a.coordinate_with("b", json!({ "ask": "progress" })).await.unwrap();
    assert_eq!(reply["echo"]["ask"], "progress");
    assert_eq!(a.pending_requests(), 0);
}
