//! Plan and result types, plus TOML loading and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::agent::AgentResponse;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_ms,
        }
    }

    /// Linear backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub agent_id: String,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            action: action.into(),
            input: Value::Null,
            dependencies: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationPlan {
    pub id: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub parallel: bool,
    /// Overall deadline for the plan in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub fallback_plan: Option<Box<OrchestrationPlan>>,
}

impl OrchestrationPlan {
    pub fn sequential(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            steps,
            parallel: false,
            timeout_ms: None,
            fallback_plan: None,
        }
    }

    pub fn parallel(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            parallel: true,
            ..Self::sequential(id, steps)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_fallback(mut self, fallback: OrchestrationPlan) -> Self {
        self.fallback_plan = Some(Box::new(fallback));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Every agent id referenced by this plan or its fallbacks.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut current = Some(self);
        while let Some(plan) = current {
            for step in &plan.steps {
                if seen.insert(step.agent_id.as_str()) {
                    ids.push(step.agent_id.clone());
                }
            }
            current = plan.fallback_plan.as_deref();
        }
        ids
    }
}

/// Outcome of a plan. `errors` is empty on success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub plan_id: String,
    pub success: bool,
    pub results: HashMap<String, AgentResponse>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
    pub attempts: HashMap<String, u32>,
    pub duration_ms: u64,
}

/// Load a plan from a TOML file and validate it.
pub fn load_plan(path: &Path) -> Result<OrchestrationPlan> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {:?}", path))?;

    let plan: OrchestrationPlan = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML plan: {:?}", path))?;

    validate_plan(&plan)?;
    Ok(plan)
}

/// Structural checks: non-empty, unique step ids, known and acyclic
/// dependencies. Fallback plans are validated too.
pub fn validate_plan(plan: &OrchestrationPlan) -> CoreResult<()> {
    if plan.id.is_empty() {
        return Err(CoreError::InvalidPlan("plan id cannot be empty".to_string()));
    }
    if plan.steps.is_empty() {
        return Err(CoreError::InvalidPlan(format!(
            "plan '{}' must contain at least one step",
            plan.id
        )));
    }

    let mut step_ids = HashSet::new();
    for step in &plan.steps {
        if !step_ids.insert(step.id.as_str()) {
            return Err(CoreError::InvalidPlan(format!("duplicate step id: {}", step.id)));
        }
    }

    for step in &plan.steps {
        for dep in &step.dependencies {
            if dep == &step.id {
                return Err(CoreError::InvalidPlan(format!("step {} depends on itself", step.id)));
            }
            if !step_ids.contains(dep.as_str()) {
                return Err(CoreError::InvalidPlan(format!(
                    "step {} depends on non-existent step: {}",
                    step.id, dep
                )));
            }
        }
    }

    // Kahn's algorithm: anything left unresolved sits on a cycle.
    let mut resolved: HashSet<&str> = HashSet::new();
    loop {
        let ready: Vec<&str> = plan
            .steps
            .iter()
            .filter(|s| !resolved.contains(s.id.as_str()))
            .filter(|s| s.dependencies.iter().all(|d| resolved.contains(d.as_str())))
            .map(|s| s.id.as_str())
            .collect();
        if ready.is_empty() {
            break;
        }
        resolved.extend(ready);
    }
    if resolved.len() != plan.steps.len() {
        let mut cyclic: Vec<&str> = step_ids.difference(&resolved).copied().collect();
        cyclic.sort_unstable();
        return Err(CoreError::InvalidPlan(format!(
            "circular dependency between steps {:?}",
            cyclic
        )));
    }

    if let Some(fallback) = &plan.fallback_plan {
        validate_plan(fallback)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_plan_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
id = "lesson"
parallel = true
timeout_ms = 2000

[[steps]]
id = "assess"
agent_id = "assessor"
action = "assess"
input = {{ topic = "fractions" }}

[[steps]]
id = "hint"
agent_id = "tutor"
action = "hint"
dependencies = ["assess"]
retry_policy = {{ max_retries = 2, backoff_ms = 10 }}

[fallback_plan]
id = "lesson-fallback"

[[fallback_plan.steps]]
id = "apologize"
agent_id = "tutor"
action = "fallback"
"#
        )
        .unwrap();

        let plan = load_plan(file.path()).unwrap();
        assert!(plan.parallel);
        assert_eq!(plan.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(plan.steps[0].input["topic"], "fractions");
        assert_eq!(plan.steps[1].retry_policy, Some(RetryPolicy::new(2, 10)));
        assert_eq!(plan.fallback_plan.as_ref().unwrap().steps.len(), 1);
        assert_eq!(plan.agent_ids(), vec!["assessor", "tutor"]);
    }

    #[test]
    fn test_validation_rejects_bad_plans() {
        let empty = OrchestrationPlan::sequential("p", vec![]);
        assert!(validate_plan(&empty).is_err());

        let twice = vec![Step::new("a", "x", "go"), Step::new("a", "x", "go")];
        let duplicate = OrchestrationPlan::sequential("p", twice);
        assert!(validate_plan(&duplicate).is_err());

        let dangling = vec![Step::new("a", "x", "go").depends_on(["missing"])];
        let unknown = OrchestrationPlan::sequential("p", dangling);
        assert!(validate_plan(&unknown).is_err());

        let cyclic = OrchestrationPlan::parallel(
            "p",
            vec![
                Step::new("a", "x", "go").depends_on(["b"]),
                Step::new("b", "x", "go").depends_on(["a"]),
                Step::new("c", "x", "go"),
            ],
        );
        let err = validate_plan(&cyclic).unwrap_err().to_string();
        assert!(err.contains("circular"), "{err}");
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(3, 25);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(25));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(75));
    }
}
