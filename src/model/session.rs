use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Policy deciding which pending agents may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Every agent whose dependencies are satisfied starts immediately.
    Parallel,
    /// One agent at a time, in registration order. Dependencies are advisory.
    Sequential,
    /// Parallel rule, re-evaluated each time an agent completes.
    #[default]
    Adaptive,
    /// Phases run in order; agents within the active phase follow the parallel rule.
    Pipeline,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Adaptive => "adaptive",
            Self::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub objective: String,
    pub strategy: ExecutionStrategy,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub agent_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn new(
        id: SessionId,
        objective: impl Into<String>,
        strategy: ExecutionStrategy,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id,
            objective: objective.into(),
            strategy,
            state: SessionState::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            agent_count: 0,
            completed_count: 0,
            failed_count: 0,
            metadata,
        }
    }

    pub fn counters_consistent(&self) -> bool {
        self.completed_count + self.failed_count <= self.agent_count
    }
}
