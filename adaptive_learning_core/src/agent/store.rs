//! Persistence for agent state snapshots and liveness heartbeats.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, instrument};

use super::AgentStatus;
use crate::error::{CoreError, CoreResult};
use crate::memory::AgentMemory;

/// Everything needed to restore an agent after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub learner_id: String,
    pub session_id: String,
    pub status: AgentStatus,
    pub context: HashMap<String, Value>,
    pub memory: AgentMemory,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait AgentStateStore: Send + Sync {
    async fn load(&self, agent_id: &str) -> CoreResult<Option<AgentSnapshot>>;

    async fn save(&self, snapshot: &AgentSnapshot) -> CoreResult<()>;

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> CoreResult<()>;

    async fn last_heartbeat(&self, agent_id: &str) -> CoreResult<Option<DateTime<Utc>>>;
}

/// Process-local store for tests and ephemeral agents.
#[derive(Default)]
pub struct InMemoryStateStore {
    snapshots: DashMap<String, AgentSnapshot>,
    heartbeats: DashMap<String, DateTime<Utc>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStateStore for InMemoryStateStore {
    async fn load(&self, agent_id: &str) -> CoreResult<Option<AgentSnapshot>> {
        Ok(self.snapshots.get(agent_id).map(|s| s.clone()))
    }

    async fn save(&self, snapshot: &AgentSnapshot) -> CoreResult<()> {
        self.snapshots
            .insert(snapshot.agent_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> CoreResult<()> {
        self.heartbeats.insert(agent_id.to_string(), at);
        Ok(())
    }

    async fn last_heartbeat(&self, agent_id: &str) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(self.heartbeats.get(agent_id).map(|at| *at))
    }
}

/// Durable store on an embedded sled database.
pub struct SledStateStore {
    db: sled::Db,
}

impl SledStateStore {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn state_key(agent_id: &str) -> String {
        format!("state:{agent_id}")
    }

    fn heartbeat_key(agent_id: &str) -> String {
        format!("heartbeat:{agent_id}")
    }
}

#[async_trait]
impl AgentStateStore for SledStateStore {
    async fn load(&self, agent_id: &str) -> CoreResult<Option<AgentSnapshot>> {
        match self.db.get(Self::state_key(agent_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, snapshot), fields(agent_id = %snapshot.agent_id))]
    async fn save(&self, snapshot: &AgentSnapshot) -> CoreResult<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        self.db.insert(Self::state_key(&snapshot.agent_id), bytes)?;
        self.db.flush_async().await?;
        debug!("Agent snapshot persisted");
        Ok(())
    }

    async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> CoreResult<()> {
        self.db
            .insert(Self::heartbeat_key(agent_id), at.to_rfc3339().as_bytes())?;
        Ok(())
    }

    async fn last_heartbeat(&self, agent_id: &str) -> CoreResult<Option<DateTime<Utc>>> {
        let Some(bytes) = self.db.get(Self::heartbeat_key(agent_id))? else {
            return Ok(None);
        };
        let raw = String::from_utf8_lossy(&bytes);
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(|e| CoreError::StateStore(format!("corrupt heartbeat for {agent_id}: {e}")))
    }
}
