//! Runs multi-step plans across registered agents with dependency waiting,
//! retries, deadlines and plan-level fallback.

pub mod plan;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{Agent, AgentInput, AgentResponse};
use crate::bus::{MessageBus, QueuedJob, EXECUTE_STEP_QUEUE};
use crate::error::{CoreError, CoreResult};
use crate::settings::OrchestratorConfig;

pub use plan::{load_plan, validate_plan, OrchestrationPlan, OrchestrationResult, RetryPolicy, Step};

/// Lifecycle notifications emitted while plans run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    PlanStarted { plan_id: String, parallel: bool, steps: usize },
    PlanCompleted { plan_id: String, success: bool, duration_ms: u64 },
    PlanFailed { plan_id: String, error: String },
    FallbackTriggered { plan_id: String, fallback_plan_id: String, reason: String },
    StepStarted { plan_id: String, step_id: String, agent_id: String, attempt: u32 },
    StepCompleted { plan_id: String, step_id: String, attempt: u32 },
    StepRetrying { plan_id: String, step_id: String, attempt: u32, backoff_ms: u64, error: String },
    StepFailed { plan_id: String, step_id: String, attempts: u32, error: String },
}

/// One attempt at one step, as kept in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub plan_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub action: String,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Shared state of one plan execution.
#[derive(Default)]
struct PlanRun {
    results: DashMap<String, AgentResponse>,
    errors: DashMap<String, String>,
    attempts: DashMap<String, u32>,
}

impl PlanRun {
    fn missing<'a>(&self, dependencies: &'a [String]) -> Vec<&'a String> {
        dependencies
            .iter()
            .filter(|dep| !self.results.contains_key(dep.as_str()))
            .collect()
    }

    fn into_result(self, plan_id: &str, success: bool, started: Instant) -> OrchestrationResult {
        OrchestrationResult {
            plan_id: plan_id.to_string(),
            success,
            results: self.results.into_iter().collect(),
            errors: self.errors.into_iter().collect(),
            attempts: self.attempts.into_iter().collect(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

pub struct Orchestrator {
    agents: DashMap<String, Arc<Agent>>,
    bus: Arc<dyn MessageBus>,
    config: OrchestratorConfig,
    events: broadcast::Sender<OrchestrationEvent>,
    audit_log: Mutex<VecDeque<ExecutionRecord>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, bus: Arc<dyn MessageBus>) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            agents: DashMap::new(),
            bus,
            config,
            events,
            audit_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Initialize an agent and add it to the registry. Agent ids are unique.
    #[instrument(skip(self, agent), fields(agent_id = %agent.agent_id()))]
    pub async fn register_agent(&self, agent: Arc<Agent>) -> CoreResult<()> {
        let agent_id = agent.agent_id().to_string();
        if self.agents.contains_key(&agent_id) {
            return Err(CoreError::AgentAlreadyRegistered(agent_id));
        }

        agent.initialize().await?;

        match self.agents.entry(agent_id.clone()) {
            Entry::Occupied(_) => Err(CoreError::AgentAlreadyRegistered(agent_id)),
            Entry::Vacant(slot) => {
                slot.insert(agent);
                info!("Registered agent: {}", agent_id);
                Ok(())
            }
        }
    }

    /// Remove an agent and shut it down.
    pub async fn unregister_agent(&self, agent_id: &str) -> CoreResult<()> {
        let (_, agent) = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| CoreError::UnknownAgent(agent_id.to_string()))?;
        agent.shutdown().await?;
        info!("Unregistered agent: {}", agent_id);
        Ok(())
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    /// Get list of registered agent ids, sorted
    pub fn list_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Shut down every registered agent. Failures are logged; the first one
    /// is returned after all agents have been attempted.
    pub async fn shutdown_all(&self) -> CoreResult<()> {
        let agents: Vec<Arc<Agent>> = self.agents.iter().map(|e| e.value().clone()).collect();
        self.agents.clear();

        let mut first_error = None;
        for agent in agents {
            if let Err(e) = agent.shutdown().await {
                error!("Failed to shut down agent '{}': {}", agent.agent_id(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    /// Most recent audit records, oldest first.
    pub fn audit_log(&self) -> Vec<ExecutionRecord> {
        self.audit_log.lock().iter().cloned().collect()
    }

    fn emit(&self, event: OrchestrationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn record(&self, record: ExecutionRecord) {
        let mut log = self.audit_log.lock();
        log.push_back(record);
        while log.len() > self.config.audit_log_capacity {
            log.pop_front();
        }
    }

    /// Execute a plan. A plan-level failure (deadline expiry, or a sequential
    /// step exhausting its retries) re-enters with the fallback plan when one
    /// is configured, otherwise it is returned as an error.
    pub fn orchestrate<'a>(
        &'a self,
        plan: &'a OrchestrationPlan,
    ) -> BoxFuture<'a, CoreResult<OrchestrationResult>> {
        async move {
            validate_plan(plan)?;
            info!(
                "Starting plan '{}' ({} steps, {})",
                plan.id,
                plan.steps.len(),
                if plan.parallel { "parallel" } else { "sequential" }
            );
            self.emit(OrchestrationEvent::PlanStarted {
                plan_id: plan.id.clone(),
                parallel: plan.parallel,
                steps: plan.steps.len(),
            });

            let outcome = match plan.timeout() {
                Some(deadline) => match tokio::time::timeout(deadline, self.run_plan(plan)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CoreError::PlanTimeout {
                        plan_id: plan.id.clone(),
                        timeout_ms: deadline.as_millis() as u64,
                    }),
                },
                None => self.run_plan(plan).await,
            };

            match outcome {
                Ok(result) => {
                    info!(
                        "Plan '{}' finished (success: {}) in {}ms",
                        plan.id, result.success, result.duration_ms
                    );
                    self.emit(OrchestrationEvent::PlanCompleted {
                        plan_id: plan.id.clone(),
                        success: result.success,
                        duration_ms: result.duration_ms,
                    });
                    Ok(result)
                }
                Err(e) => {
                    self.emit(OrchestrationEvent::PlanFailed {
                        plan_id: plan.id.clone(),
                        error: e.to_string(),
                    });
                    match plan.fallback_plan.as_deref() {
                        Some(fallback) => {
                            warn!(
                                "Plan '{}' failed ({}), running fallback '{}'",
                                plan.id, e, fallback.id
                            );
                            self.emit(OrchestrationEvent::FallbackTriggered {
                                plan_id: plan.id.clone(),
                                fallback_plan_id: fallback.id.clone(),
                                reason: e.to_string(),
                            });
                            self.orchestrate(fallback).await
                        }
                        None if e.is_timeout() => {
                            warn!("Plan '{}' timed out: {}", plan.id, e);
                            Err(e)
                        }
                        None => {
                            error!("Plan '{}' failed: {}", plan.id, e);
                            Err(e)
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn run_plan(&self, plan: &OrchestrationPlan) -> CoreResult<OrchestrationResult> {
        let started = Instant::now();
        let run = PlanRun::default();
        let dependency_timeout = plan
            .timeout()
            .unwrap_or_else(|| self.config.default_dependency_timeout());

        if plan.parallel {
            // Settle all: a failing step never cancels its siblings.
            let outcomes = join_all(
                plan.steps
                    .iter()
                    .map(|step| self.execute_step(&plan.id, step, &run, dependency_timeout)),
            )
            .await;
            let failed = outcomes.iter().filter(|o| o.is_err()).count();
            if failed > 0 {
                warn!("Plan '{}': {} of {} steps failed", plan.id, failed, plan.steps.len());
            }
            let success = run.errors.is_empty();
            Ok(run.into_result(&plan.id, success, started))
        } else {
            for step in &plan.steps {
                self.execute_step(&plan.id, step, &run, dependency_timeout)
                    .await?;
            }
            Ok(run.into_result(&plan.id, true, started))
        }
    }

    /// Run one step under its retry policy. Dependencies are re-checked on
    /// every attempt; a later success clears the recorded error.
    async fn execute_step(
        &self,
        plan_id: &str,
        step: &Step,
        run: &PlanRun,
        dependency_timeout: Duration,
    ) -> CoreResult<AgentResponse> {
        let policy = step.retry_policy.unwrap_or_default();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            run.attempts.insert(step.id.clone(), attempt);

            let outcome = match self.wait_for_dependencies(step, run, dependency_timeout).await {
                Ok(()) => self.dispatch_step(plan_id, step, attempt).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => {
                    run.errors.remove(&step.id);
                    run.results.insert(step.id.clone(), response.clone());
                    self.emit(OrchestrationEvent::StepCompleted {
                        plan_id: plan_id.to_string(),
                        step_id: step.id.clone(),
                        attempt,
                    });
                    return Ok(response);
                }
                Err(e) => {
                    run.errors.insert(step.id.clone(), e.to_string());

                    if attempt <= policy.max_retries {
                        let backoff = policy.backoff_for(attempt);
                        warn!(
                            "Step '{}' failed (attempt {}), retrying in {:?}: {}",
                            step.id, attempt, backoff, e
                        );
                        self.emit(OrchestrationEvent::StepRetrying {
                            plan_id: plan_id.to_string(),
                            step_id: step.id.clone(),
                            attempt,
                            backoff_ms: backoff.as_millis() as u64,
                            error: e.to_string(),
                        });
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                        continue;
                    }

                    error!("Step '{}' failed after {} attempt(s): {}", step.id, attempt, e);
                    self.emit(OrchestrationEvent::StepFailed {
                        plan_id: plan_id.to_string(),
                        step_id: step.id.clone(),
                        attempts: attempt,
                        error: e.to_string(),
                    });
                    return Err(match e {
                        CoreError::DependencyWaitTimeout { .. } => e,
                        other => CoreError::StepExecutionFailure {
                            step_id: step.id.clone(),
                            attempts: attempt,
                            message: other.to_string(),
                        },
                    });
                }
            }
        }
    }

    async fn wait_for_dependencies(
        &self,
        step: &Step,
        run: &PlanRun,
        timeout: Duration,
    ) -> CoreResult<()> {
        if step.dependencies.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let poll_interval = self.config.dependency_poll_interval();
        loop {
            let missing = run.missing(&step.dependencies);
            if missing.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::DependencyWaitTimeout {
                    step_id: step.id.clone(),
                    missing: missing.into_iter().cloned().collect(),
                });
            }
            debug!("Step '{}' waiting on {:?}", step.id, missing);
            tokio::time::sleep(poll_interval).await;
        }
    }

    #[instrument(skip(self, step), fields(step_id = %step.id, agent_id = %step.agent_id))]
    async fn dispatch_step(
        &self,
        plan_id: &str,
        step: &Step,
        attempt: u32,
    ) -> CoreResult<AgentResponse> {
        let agent = self
            .agent(&step.agent_id)
            .ok_or_else(|| CoreError::UnknownAgent(step.agent_id.clone()))?;

        let job = QueuedJob::new(
            EXECUTE_STEP_QUEUE,
            json!({
                "stepId": step.id,
                "agentId": step.agent_id,
                "action": step.action,
                "input": step.input,
            }),
        );
        if let Err(e) = self.bus.enqueue(EXECUTE_STEP_QUEUE, job).await {
            warn!("Failed to enqueue audit job for step '{}': {}", step.id, e);
        }

        self.emit(OrchestrationEvent::StepStarted {
            plan_id: plan_id.to_string(),
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            attempt,
        });

        let started = Instant::now();
        let outcome = agent
            .process_input(AgentInput::new(step.action.clone(), step.input.clone()))
            .await;

        self.record(ExecutionRecord {
            plan_id: plan_id.to_string(),
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            action: step.action.clone(),
            attempt,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        outcome
    }
}
