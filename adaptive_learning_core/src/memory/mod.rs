//! Bounded two-tier agent memory with importance-based consolidation.
//!
//! New items enter the front of `short_term`. When the fast tier overflows,
//! the oldest items are evicted as a batch; evicted items whose importance
//! reaches the consolidation threshold move into `long_term`, which keeps only
//! the highest-importance items seen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

use crate::settings::AgentSettings;

/// Capacity limits for an [`AgentMemory`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemoryLimits {
    pub max_short_term_items: usize,
    pub max_long_term_items: usize,
    pub max_episodes: usize,
    pub consolidation_threshold: f64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for MemoryLimits {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            max_short_term_items: settings.max_short_term_items,
            max_long_term_items: settings.max_long_term_items,
            max_episodes: settings.max_episodes,
            consolidation_threshold: settings.consolidation_threshold,
        }
    }
}

/// A single remembered item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub content: Value,
    pub importance: f64,
    pub associations: BTreeSet<String>,
}

impl MemoryItem {
    /// Importance is clamped into `[0, 1]`.
    pub fn new(kind: impl Into<String>, content: Value, importance: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind: kind.into(),
            content,
            importance: clamp_importance(importance),
            associations: BTreeSet::new(),
        }
    }

    pub fn with_associations<I, S>(mut self, associations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.associations = associations.into_iter().map(Into::into).collect();
        self
    }
}

fn clamp_importance(importance: f64) -> f64 {
    if importance.is_nan() {
        0.0
    } else {
        importance.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeOutcome {
    Success,
    Failure,
    Partial,
    Ongoing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeEvent {
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub data: Value,
}

/// A bounded unit of agent activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub episode_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub events: Vec<EpisodeEvent>,
    pub outcome: EpisodeOutcome,
    pub lessons: Vec<String>,
}

impl Episode {
    fn open() -> Self {
        Self {
            episode_id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
            end_time: None,
            events: Vec::new(),
            outcome: EpisodeOutcome::Ongoing,
            lessons: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMemory {
    limits: MemoryLimits,
    short_term: VecDeque<MemoryItem>,
    long_term: Vec<MemoryItem>,
    working_memory: HashMap<String, Value>,
    episodic_memory: VecDeque<Episode>,
}

impl AgentMemory {
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            limits,
            short_term: VecDeque::new(),
            long_term: Vec::new(),
            working_memory: HashMap::new(),
            episodic_memory: VecDeque::new(),
        }
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }

    /// Replace the limits and re-establish them, consolidating any short-term
    /// overflow. Used when a persisted memory is restored under new settings.
    pub fn set_limits(&mut self, limits: MemoryLimits) {
        self.limits = limits;
        if self.short_term.len() > limits.max_short_term_items {
            let evicted: Vec<MemoryItem> = self
                .short_term
                .drain(limits.max_short_term_items..)
                .collect();
            self.consolidate(evicted);
        }
        self.long_term.truncate(limits.max_long_term_items);
        while self.episodic_memory.len() > limits.max_episodes.max(1) {
            self.episodic_memory.pop_front();
        }
    }

    /// Most-recent-first.
    pub fn short_term(&self) -> impl Iterator<Item = &MemoryItem> {
        self.short_term.iter()
    }

    /// Importance-descending.
    pub fn long_term(&self) -> &[MemoryItem] {
        &self.long_term
    }

    pub fn short_term_len(&self) -> usize {
        self.short_term.len()
    }

    pub fn long_term_len(&self) -> usize {
        self.long_term.len()
    }

    /// Insert at the front of the fast tier, evicting and consolidating the
    /// overflow. Returns the items that were promoted into `long_term`.
    pub fn add(&mut self, item: MemoryItem) -> Vec<MemoryItem> {
        self.short_term.push_front(item);

        if self.short_term.len() <= self.limits.max_short_term_items {
            return Vec::new();
        }

        let evicted: Vec<MemoryItem> = self
            .short_term
            .drain(self.limits.max_short_term_items..)
            .collect();
        self.consolidate(evicted)
    }

    fn consolidate(&mut self, evicted: Vec<MemoryItem>) -> Vec<MemoryItem> {
        let promoted: Vec<MemoryItem> = evicted
            .into_iter()
            .filter(|item| item.importance >= self.limits.consolidation_threshold)
            .collect();

        if promoted.is_empty() {
            return promoted;
        }

        self.long_term.extend(promoted.iter().cloned());
        // Stable sort keeps older entries ahead on ties.
        self.long_term.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.long_term.truncate(self.limits.max_long_term_items);

        debug!(
            "Consolidated {} item(s), long-term size {}",
            promoted.len(),
            self.long_term.len()
        );
        promoted
    }

    /// Items (short-term first, then long-term) of the given kind.
    pub fn recall_by_kind(&self, kind: &str) -> Vec<&MemoryItem> {
        self.short_term
            .iter()
            .chain(self.long_term.iter())
            .filter(|item| item.kind == kind)
            .collect()
    }

    /// Items carrying the given association tag.
    pub fn recall_by_association(&self, association: &str) -> Vec<&MemoryItem> {
        self.short_term
            .iter()
            .chain(self.long_term.iter())
            .filter(|item| item.associations.contains(association))
            .collect()
    }

    /// The `limit` most important items across both tiers.
    pub fn most_important(&self, limit: usize) -> Vec<&MemoryItem> {
        let mut items: Vec<&MemoryItem> =
            self.short_term.iter().chain(self.long_term.iter()).collect();
        items.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(limit);
        items
    }

    pub fn set_working(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.working_memory.insert(key.into(), value)
    }

    pub fn working(&self, key: &str) -> Option<&Value> {
        self.working_memory.get(key)
    }

    pub fn clear_working(&mut self) {
        self.working_memory.clear();
    }

    /// Open a new episode and return its id. The caller is responsible for
    /// closing any previously open episode first.
    pub fn start_episode(&mut self) -> String {
        let episode = Episode::open();
        let id = episode.episode_id.clone();
        self.episodic_memory.push_back(episode);
        while self.episodic_memory.len() > self.limits.max_episodes.max(1) {
            self.episodic_memory.pop_front();
        }
        id
    }

    pub fn episode(&self, episode_id: &str) -> Option<&Episode> {
        self.episodic_memory
            .iter()
            .find(|episode| episode.episode_id == episode_id)
    }

    pub fn episodes(&self) -> impl Iterator<Item = &Episode> {
        self.episodic_memory.iter()
    }

    /// Append an event to an open episode. Returns false if the episode is
    /// unknown or already closed.
    pub fn record_episode_event(
        &mut self,
        episode_id: &str,
        description: impl Into<String>,
        data: Value,
    ) -> bool {
        match self.open_episode_mut(episode_id) {
            Some(episode) => {
                episode.events.push(EpisodeEvent {
                    timestamp: Utc::now(),
                    description: description.into(),
                    data,
                });
                true
            }
            None => false,
        }
    }

    /// Close an open episode with its outcome and lessons.
    pub fn end_episode(
        &mut self,
        episode_id: &str,
        outcome: EpisodeOutcome,
        lessons: Vec<String>,
    ) -> Option<Episode> {
        let episode = self.open_episode_mut(episode_id)?;
        episode.end_time = Some(Utc::now());
        episode.outcome = outcome;
        episode.lessons = lessons;
        Some(episode.clone())
    }

    fn open_episode_mut(&mut self, episode_id: &str) -> Option<&mut Episode> {
        self.episodic_memory
            .iter_mut()
            .find(|episode| episode.episode_id == episode_id && episode.is_open())
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            short_term_items: self.short_term.len(),
            long_term_items: self.long_term.len(),
            working_memory_keys: self.working_memory.len(),
            episodes: self.episodic_memory.len(),
            open_episodes: self.episodic_memory.iter().filter(|e| e.is_open()).count(),
        }
    }
}

impl Default for AgentMemory {
    fn default() -> Self {
        Self::new(MemoryLimits::default())
    }
}

/// Memory statistics
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemoryStats {
    pub short_term_items: usize,
    pub long_term_items: usize,
    pub working_memory_keys: usize,
    pub episodes: usize,
    pub open_episodes: usize,
}
