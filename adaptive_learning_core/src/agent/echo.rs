use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Agent, AgentBehavior, AgentInput, AgentResponse};
use crate::bus::Envelope;

/// Simple echo behavior for smoke tests and plan dry runs.
///
/// Fails any input whose action is `"fail"`, which makes it handy for
/// exercising retry and fallback paths.
#[derive(Debug, Default)]
pub struct EchoBehavior {
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl EchoBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AgentBehavior for EchoBehavior {
    fn agent_type(&self) -> &str {
        "echo"
    }

    async fn process_input(&self, agent: &Agent, input: AgentInput) -> Result<AgentResponse> {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if input.action == "fail" {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return Err(anyhow!("echo asked to fail"));
        }

        Ok(AgentResponse {
            action: input.action,
            confidence: 1.0,
            reasoning: format!("echoed by {}", agent.agent_id()),
            data: input.data,
        })
    }

    async fn generate_insight(&self, _agent: &Agent) -> Result<Option<Value>> {
        Ok(Some(json!({
            "requests": self.request_count(),
            "errors": self.error_count(),
        })))
    }

    async fn fetch_learner_from_db(&self, learner_id: &str) -> Result<Value> {
        Ok(json!({ "learnerId": learner_id }))
    }

    async fn handle_agent_message(
        &self,
        _agent: &Agent,
        envelope: &Envelope,
    ) -> Result<Option<Value>> {
        Ok(Some(json!({ "echo": envelope.message })))
    }
}
