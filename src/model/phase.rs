use serde::{Deserialize, Serialize};
use std::fmt;

use super::{AgentId, PhaseId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Planned,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Ordered group of agents. Under the pipeline strategy phases gate eligibility;
/// otherwise they are a reporting view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: PhaseId,
    pub name: String,
    pub state: PhaseState,
    pub agents: Vec<AgentId>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Phase {
    pub fn planned(id: PhaseId, name: impl Into<String>, artifacts: Vec<String>) -> Self {
        Self {
            id,
            name: name.into(),
            state: PhaseState::Planned,
            agents: Vec::new(),
            artifacts,
        }
    }
}
