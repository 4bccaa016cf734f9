//! Long-lived agents: bounded memory, bus messaging and a lifecycle state
//! machine around a pluggable [`AgentBehavior`].

pub mod echo;
pub mod store;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{self, BroadcastEvent, Envelope, MessageBus, Subscription};
use crate::error::{CoreError, CoreResult};
use crate::memory::{AgentMemory, EpisodeOutcome, MemoryItem, MemoryLimits, MemoryStats};
use crate::settings::AgentSettings;

pub use echo::EchoBehavior;
pub use store::{AgentSnapshot, AgentStateStore, InMemoryStateStore, SledStateStore};

/// Context key pointing at the currently open episode.
pub const CURRENT_EPISODE_KEY: &str = "currentEpisodeId";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Processing,
    Waiting,
    Error,
}

/// Input handed to [`AgentBehavior::process_input`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInput {
    pub action: String,
    pub data: Value,
}

impl AgentInput {
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub action: String,
    pub confidence: f64,
    pub reasoning: String,
    pub data: Value,
}

/// The capability set a concrete agent provides. The framework only holds
/// trait objects; behaviors never see each other.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    fn agent_type(&self) -> &str;

    /// Behavior-specific setup, run once during [`Agent::initialize`].
    async fn initialize_specific_components(&self, _agent: &Agent) -> Result<()> {
        Ok(())
    }

    async fn process_input(&self, agent: &Agent, input: AgentInput) -> Result<AgentResponse>;

    async fn generate_insight(&self, _agent: &Agent) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Read-only learner context, fetched once and cached by the agent.
    async fn fetch_learner_from_db(&self, learner_id: &str) -> Result<Value>;

    /// Handle a direct message. Returning `Some` answers a correlated request.
    async fn handle_agent_message(
        &self,
        _agent: &Agent,
        _envelope: &Envelope,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn handle_broadcast_event(&self, _agent: &Agent, _event: &BroadcastEvent) -> Result<()> {
        Ok(())
    }
}

type PendingRequests = DashMap<String, oneshot::Sender<CoreResult<Value>>>;

/// A stateful agent. Created by the caller, initialized by the orchestrator
/// on registration and mutated only through its own methods.
pub struct Agent {
    agent_id: String,
    learner_id: String,
    session_id: String,
    settings: AgentSettings,
    behavior: Arc<dyn AgentBehavior>,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn AgentStateStore>,
    status: RwLock<AgentStatus>,
    context: RwLock<HashMap<String, Value>>,
    memory: RwLock<AgentMemory>,
    learner_context: OnceCell<Value>,
    pending: Arc<PendingRequests>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(
        agent_id: impl Into<String>,
        learner_id: impl Into<String>,
        session_id: impl Into<String>,
        behavior: Arc<dyn AgentBehavior>,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn AgentStateStore>,
        settings: AgentSettings,
    ) -> Self {
        let limits = MemoryLimits::from(&settings);
        Self {
            agent_id: agent_id.into(),
            learner_id: learner_id.into(),
            session_id: session_id.into(),
            settings,
            behavior,
            bus,
            store,
            status: RwLock::new(AgentStatus::Idle),
            context: RwLock::new(HashMap::new()),
            memory: RwLock::new(AgentMemory::new(limits)),
            learner_context: OnceCell::new(),
            pending: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn learner_id(&self) -> &str {
        &self.learner_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent_type(&self) -> &str {
        self.behavior.agent_type()
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.write() = status;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Restore persisted state, load learner context, run behavior setup,
    /// subscribe to the bus and start the heartbeat. Calling it again after
    /// success is a no-op; any failing stage leaves the agent in `Error`.
    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub async fn initialize(self: &Arc<Self>) -> CoreResult<()> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown(self.agent_id.clone()));
        }

        match self.run_initialization().await {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                self.set_status(AgentStatus::Idle);
                info!("Agent '{}' ({}) initialized", self.agent_id, self.agent_type());
                Ok(())
            }
            Err(e) => {
                self.abort_tasks();
                self.set_status(AgentStatus::Error);
                error!("Agent '{}' failed to initialize: {}", self.agent_id, e);
                Err(e)
            }
        }
    }

    async fn run_initialization(self: &Arc<Self>) -> CoreResult<()> {
        let snapshot = self
            .store
            .load(&self.agent_id)
            .await
            .map_err(|e| self.init_error("load_state", e))?;
        if let Some(snapshot) = snapshot {
            self.restore(snapshot);
        }

        self.learner_context()
            .await
            .map_err(|e| self.init_error("load_learner_context", e))?;

        self.behavior
            .initialize_specific_components(self)
            .await
            .map_err(|e| self.init_error("initialize_components", e))?;

        self.start_subscriptions()
            .await
            .map_err(|e| self.init_error("subscribe", e))?;

        self.start_heartbeat();
        Ok(())
    }

    fn init_error(&self, stage: &'static str, err: impl std::fmt::Display) -> CoreError {
        CoreError::AgentInitialization {
            agent_id: self.agent_id.clone(),
            stage,
            message: err.to_string(),
        }
    }

    fn restore(&self, snapshot: AgentSnapshot) {
        let mut memory = snapshot.memory;
        memory.set_limits(MemoryLimits::from(&self.settings));
        *self.memory.write() = memory;
        *self.context.write() = snapshot.context;
        debug!("Restored persisted state for agent '{}'", self.agent_id);
    }

    /// Learner context from the behavior, cached after the first fetch.
    pub async fn learner_context(&self) -> CoreResult<&Value> {
        self.learner_context
            .get_or_try_init(|| async {
                self.behavior
                    .fetch_learner_from_db(&self.learner_id)
                    .await
                    .map_err(|e| {
                        CoreError::NotFound(format!("learner '{}': {}", self.learner_id, e))
                    })
            })
            .await
    }

    async fn start_subscriptions(self: &Arc<Self>) -> CoreResult<()> {
        // Subscribe before spawning so nothing published in between is lost.
        let inbound = self.bus.subscribe(&bus::inbound_channel(&self.agent_id)).await?;
        let responses = self.bus.subscribe(&bus::response_channel(&self.agent_id)).await?;
        let events = if self.settings.subscribe_broadcasts {
            Some(self.bus.subscribe(bus::EVENTS_CHANNEL).await?)
        } else {
            None
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::inbound_loop(Arc::downgrade(self), inbound)));
        tasks.push(tokio::spawn(Self::response_loop(
            self.agent_id.clone(),
            self.pending.clone(),
            responses,
        )));
        if let Some(events) = events {
            tasks.push(tokio::spawn(Self::event_loop(Arc::downgrade(self), events)));
        }
        Ok(())
    }

    async fn inbound_loop(agent: Weak<Agent>, mut subscription: Subscription) {
        while let Some(raw) = subscription.recv().await {
            let Some(agent) = agent.upgrade() else { break };
            let envelope: Envelope = match serde_json::from_value(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Agent '{}' dropped malformed envelope: {}", agent.agent_id, e);
                    continue;
                }
            };

            let reply = match agent.behavior.handle_agent_message(&agent, &envelope).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(
                        "Agent '{}' failed to handle message from '{}': {}",
                        agent.agent_id, envelope.from_agent, e
                    );
                    Some(json!({ "error": e.to_string() }))
                }
            };

            let correlation_id = envelope.correlation_id.clone();
            if let (Some(correlation_id), Some(message)) = (correlation_id, reply) {
                let response = Envelope::new(&agent.agent_id, &envelope.from_agent, message)
                    .with_correlation_id(correlation_id);
                let channel = bus::response_channel(&envelope.from_agent);
                match serde_json::to_value(&response) {
                    Ok(value) => {
                        if let Err(e) = agent.bus.publish(&channel, value).await {
                            warn!("Agent '{}' failed to publish response: {}", agent.agent_id, e);
                        }
                    }
                    Err(e) => warn!("Agent '{}' failed to encode response: {}", agent.agent_id, e),
                }
            }
        }
    }

    async fn response_loop(
        agent_id: String,
        pending: Arc<PendingRequests>,
        mut subscription: Subscription,
    ) {
        while let Some(raw) = subscription.recv().await {
            let envelope: Envelope = match serde_json::from_value(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Agent '{}' dropped malformed response: {}", agent_id, e);
                    continue;
                }
            };
            let Some(correlation_id) = envelope.correlation_id else { continue };
            // Expired requests were already removed, so late replies fall through.
            match pending.remove(&correlation_id) {
                Some((_, sender)) => {
                    let _ = sender.send(Ok(envelope.message));
                }
                None => debug!("Agent '{}' ignored late response {}", agent_id, correlation_id),
            }
        }
    }

    async fn event_loop(agent: Weak<Agent>, mut subscription: Subscription) {
        while let Some(raw) = subscription.recv().await {
            let Some(agent) = agent.upgrade() else { break };
            let event: BroadcastEvent = match serde_json::from_value(raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Agent '{}' dropped malformed event: {}", agent.agent_id, e);
                    continue;
                }
            };
            if event.from_agent == agent.agent_id {
                continue;
            }
            if let Err(e) = agent.behavior.handle_broadcast_event(&agent, &event).await {
                warn!(
                    "Agent '{}' failed to handle event '{}': {}",
                    agent.agent_id, event.event_type, e
                );
            }
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let agent = Arc::downgrade(self);
        let period = self.settings.heartbeat_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(agent) = agent.upgrade() else { break };
                if let Err(e) = agent.heartbeat().await {
                    warn!("Heartbeat for agent '{}' failed: {}", agent.agent_id, e);
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Persist state and record a liveness signal.
    pub async fn heartbeat(&self) -> CoreResult<()> {
        self.store.save(&self.snapshot()).await?;
        self.store.record_heartbeat(&self.agent_id, Utc::now()).await?;
        debug!("Heartbeat recorded for agent '{}'", self.agent_id);
        Ok(())
    }

    /// Run the behavior on one input, tracking status and remembering the
    /// interaction with importance equal to the response confidence.
    #[instrument(skip(self, input), fields(agent_id = %self.agent_id, action = %input.action))]
    pub async fn process_input(&self, input: AgentInput) -> CoreResult<AgentResponse> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown(self.agent_id.clone()));
        }

        self.set_status(AgentStatus::Processing);
        match self.behavior.process_input(self, input.clone()).await {
            Ok(response) => {
                self.remember(
                    MemoryItem::new(
                        "interaction",
                        json!({
                            "action": input.action,
                            "input": input.data,
                            "responseAction": response.action,
                        }),
                        response.confidence,
                    )
                    .with_associations([input.action.clone()]),
                );
                self.record_episode_event(
                    format!("processed {}", input.action),
                    json!({ "confidence": response.confidence }),
                );
                self.set_status(AgentStatus::Idle);
                Ok(response)
            }
            Err(e) => {
                self.set_status(AgentStatus::Error);
                Err(CoreError::BehaviorFailure {
                    agent_id: self.agent_id.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    pub async fn generate_insight(&self) -> CoreResult<Option<Value>> {
        self.behavior
            .generate_insight(self)
            .await
            .map_err(|e| CoreError::BehaviorFailure {
                agent_id: self.agent_id.clone(),
                message: e.to_string(),
            })
    }

    /// Send a correlated request to another agent and wait for its reply.
    #[instrument(skip(self, message), fields(agent_id = %self.agent_id))]
    pub async fn coordinate_with(&self, target_id: &str, message: Value) -> CoreResult<Value> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown(self.agent_id.clone()));
        }
        if !self.settings.enable_coordination {
            return Err(CoreError::CoordinationDisabled(self.agent_id.clone()));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        let envelope = Envelope::new(&self.agent_id, target_id, message)
            .with_correlation_id(correlation_id.clone());
        let published = match serde_json::to_value(&envelope) {
            Ok(value) => self.bus.publish(&bus::inbound_channel(target_id), value).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        let previous = self.status();
        self.set_status(AgentStatus::Waiting);
        let timeout = self.settings.coordination_timeout();
        let outcome = tokio::time::timeout(timeout, rx).await;
        self.set_status(previous);

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::ShuttingDown(self.agent_id.clone())),
            Err(_) => {
                self.pending.remove(&correlation_id);
                warn!("Coordination from '{}' to '{}' timed out", self.agent_id, target_id);
                Err(CoreError::CoordinationTimeout {
                    target: target_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget publish on the shared events channel.
    pub async fn broadcast_event(&self, event_type: &str, payload: Value) -> CoreResult<()> {
        let event = BroadcastEvent {
            from_agent: self.agent_id.clone(),
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.bus
            .publish(bus::EVENTS_CHANNEL, serde_json::to_value(&event)?)
            .await?;
        Ok(())
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Flush state, stop the heartbeat and subscriptions, and reject every
    /// in-flight coordination request.
    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.shutting_down.store(true, Ordering::Release);

        let flushed = self.store.save(&self.snapshot()).await;
        self.abort_tasks();

        let correlation_ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for correlation_id in correlation_ids {
            if let Some((_, sender)) = self.pending.remove(&correlation_id) {
                let _ = sender.send(Err(CoreError::ShuttingDown(self.agent_id.clone())));
            }
        }

        self.initialized.store(false, Ordering::Release);
        info!("Agent '{}' shut down", self.agent_id);
        flushed
    }

    fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn remember(&self, item: MemoryItem) -> Vec<MemoryItem> {
        self.memory.write().add(item)
    }

    /// Read access to the agent's memory.
    pub fn with_memory<R>(&self, f: impl FnOnce(&AgentMemory) -> R) -> R {
        f(&self.memory.read())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.read().stats()
    }

    pub fn set_working_memory(&self, key: &str, value: Value) {
        self.memory.write().set_working(key, value);
    }

    pub fn working_memory(&self, key: &str) -> Option<Value> {
        self.memory.read().working(key).cloned()
    }

    pub fn set_context(&self, key: &str, value: Value) {
        self.context.write().insert(key.to_string(), value);
    }

    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.context.read().get(key).cloned()
    }

    pub fn current_episode_id(&self) -> Option<String> {
        self.context_value(CURRENT_EPISODE_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Open a new episode. Any episode still open is closed as `Partial`.
    pub fn start_episode(&self) -> String {
        if self.current_episode_id().is_some() {
            self.end_episode(EpisodeOutcome::Partial, Vec::new());
        }
        let episode_id = self.memory.write().start_episode();
        self.set_context(CURRENT_EPISODE_KEY, json!(episode_id));
        episode_id
    }

    /// Append to the open episode; a no-op when none is open.
    pub fn record_episode_event(&self, description: impl Into<String>, data: Value) -> bool {
        match self.current_episode_id() {
            Some(episode_id) => self
                .memory
                .write()
                .record_episode_event(&episode_id, description, data),
            None => false,
        }
    }

    pub fn end_episode(
        &self,
        outcome: EpisodeOutcome,
        lessons: Vec<String>,
    ) -> Option<crate::memory::Episode> {
        let episode_id = self.current_episode_id()?;
        self.context.write().remove(CURRENT_EPISODE_KEY);
        self.memory.write().end_episode(&episode_id, outcome, lessons)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            learner_id: self.learner_id.clone(),
            session_id: self.session_id.clone(),
            status: self.status(),
            context: self.context.read().clone(),
            memory: self.memory.read().clone(),
            saved_at: Utc::now(),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.agent_id)
            .field("learner_id", &self.learner_id)
            .field("agent_type", &self.agent_type())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use anyhow::anyhow;
    use std::time::Duration;

    struct FailingSetup;

    #[async_trait]
    impl AgentBehavior for FailingSetup {
        fn agent_type(&self) -> &str {
            "failing"
        }

        async fn initialize_specific_components(&self, _agent: &Agent) -> Result<()> {
            Err(anyhow!("model weights missing"))
        }

        async fn process_input(&self, _agent: &Agent, _input: AgentInput) -> Result<AgentResponse> {
            Err(anyhow!("unreachable"))
        }

        async fn fetch_learner_from_db(&self, learner_id: &str) -> Result<Value> {
            Ok(json!({ "learnerId": learner_id }))
        }
    }

    /// Never answers direct messages.
    struct Silent;

    #[async_trait]
    impl AgentBehavior for Silent {
        fn agent_type(&self) -> &str {
            "silent"
        }

        async fn process_input(&self, _agent: &Agent, input: AgentInput) -> Result<AgentResponse> {
            Ok(AgentResponse {
                action: input.action,
                confidence: 0.2,
                reasoning: "ok".to_string(),
                data: Value::Null,
            })
        }

        async fn fetch_learner_from_db(&self, _learner_id: &str) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            coordination_timeout_ms: 100,
            heartbeat_interval_ms: 50,
            ..AgentSettings::default()
        }
    }

    fn agent(
        id: &str,
        behavior: Arc<dyn AgentBehavior>,
        bus: Arc<InMemoryBus>,
        store: Arc<InMemoryStateStore>,
        settings: AgentSettings,
    ) -> Arc<Agent> {
        Arc::new(Agent::new(id, "learner-1", "session-1", behavior, bus, store, settings))
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStateStore::new());
        let a = agent("a", Arc::new(EchoBehavior::new()), bus.clone(), store, settings());
        a.initialize().await.unwrap();
        a.initialize().await.unwrap();
        assert!(a.is_initialized());
        assert_eq!(bus.subscriber_count(&bus::inbound_channel("a")), 1);
        assert_eq!(a.learner_context().await.unwrap()["learnerId"], "learner-1");
    }

    #[tokio::test]
    async fn test_failed_setup_leaves_error_status() {
        let a = agent(
            "broken",
            Arc::new(FailingSetup),
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryStateStore::new()),
            settings(),
        );
        let err = a.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::AgentInitialization { stage: "initialize_components", .. }
        ));
        assert_eq!(a.status(), AgentStatus::Error);
        assert!(!a.is_initialized());
    }

    #[tokio::test]
    async fn test_process_input_remembers_interaction() {
        let a = agent(
            "a",
            Arc::new(Silent),
            Arc::new(InMemoryBus::new()),
            Arc::new(InMemoryStateStore::new()),
            settings(),
        );
        let response = a.process_input(AgentInput::new("assess", json!({"x": 1}))).await.unwrap();
        assert_eq!(response.action, "assess");
        assert_eq!(a.status(), AgentStatus::Idle);
        assert_eq!(a.with_memory(|m| m.recall_by_association("assess").len()), 1);
    }

    #[tokio::test]
    async fn test_coordinate_with_round_trip() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStateStore::new());
        let caller = agent("caller", Arc::new(Silent), bus.clone(), store.clone(), settings());
        let echo = agent("echo", Arc::new(EchoBehavior::new()), bus.clone(), store, settings());
        caller.initialize().await.unwrap();
        echo.initialize().await.unwrap();

        let reply = caller.coordinate_with("echo", json!({"ping": 1})).await.unwrap();
        assert_eq!(reply["echo"], json!({"ping": 1}));
        assert_eq!(caller.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_coordinate_with_times_out_and_cleans_up() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStateStore::new());
        let caller = agent("caller", Arc::new(Silent), bus.clone(), store.clone(), settings());
        let silent = agent("quiet", Arc::new(Silent), bus, store, settings());
        caller.initialize().await.unwrap();
        silent.initialize().await.unwrap();

        let err = caller.coordinate_with("quiet", json!("hello")).await.unwrap_err();
        assert!(matches!(err, CoreError::CoordinationTimeout { .. }));
        assert_eq!(caller.pending_requests(), 0);
        assert_eq!(caller.status(), AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_coordination_can_be_disabled() {
        let mut disabled = settings();
        disabled.enable_coordination = false;
        let bus = Arc::new(InMemoryBus::new());
        let a = agent("a", Arc::new(Silent), bus, Arc::new(InMemoryStateStore::new()), disabled);
        let err = a.coordinate_with("b", json!(null)).await.unwrap_err();
        assert!(matches!(err, CoreError::CoordinationDisabled(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_in_flight_requests() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStateStore::new());
        let mut slow = settings();
        slow.coordination_timeout_ms = 5_000;
        let caller = agent("caller", Arc::new(Silent), bus.clone(), store.clone(), slow);
        caller.initialize().await.unwrap();

        let in_flight = {
            let caller = caller.clone();
            tokio::spawn(async move { caller.coordinate_with("nobody", json!(1)).await })
        };
        while caller.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        caller.shutdown().await.unwrap();
        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::ShuttingDown(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(&bus::inbound_channel("caller")), 0);
        assert!(store.load("caller").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_persists_state() {
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let a = agent("beat", Arc::new(Silent), bus, store.clone(), settings());
        a.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.last_heartbeat("beat").await.unwrap().is_some());
        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_restores_persisted_memory() {
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let first = agent("persist", Arc::new(Silent), bus.clone(), store.clone(), settings());
        first.remember(MemoryItem::new("fact", json!("x"), 0.9));
        first.shutdown().await.unwrap();

        let second = agent("persist", Arc::new(Silent), bus, store, settings());
        second.initialize().await.unwrap();
        assert_eq!(second.with_memory(|m| m.recall_by_kind("fact").len()), 1);
    }

    #[tokio::test]
    async fn test_single_open_episode() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryStateStore::new());
        let a = agent("ep", Arc::new(Silent), bus, store, settings());
        let first = a.start_episode();
        let second = a.start_episode();
        assert_ne!(first, second);
        assert_eq!(a.memory_stats().open_episodes, 1);
        assert_eq!(
            a.with_memory(|m| m.episode(&first).map(|e| e.outcome)),
            Some(EpisodeOutcome::Partial)
        );

        a.process_input(AgentInput::new("step", json!(null))).await.unwrap();
        let closed = a.end_episode(EpisodeOutcome::Success, vec!["ok".into()]).unwrap();
        assert_eq!(closed.episode_id, second);
        assert_eq!(closed.events.len(), 1);
        assert!(a.current_episode_id().is_none());
    }
}
