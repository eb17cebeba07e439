use thiserror::Error;

use crate::agents::launcher::LaunchError;
use crate::agents::resource_limiter::AdmissionError;
use crate::checkpoint::store::StoreError;
use crate::model::{AgentId, SessionId};

/// Errors surfaced by the orchestration core.
///
/// Structural problems (`InvalidDependencyGraph`, `InvalidPlan`) are returned synchronously
/// from the request that caused them. Runtime failures of individual agents are recorded on
/// the agent and published on the event stream instead of being returned here.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Invalid dependency graph: {reason}")]
    InvalidDependencyGraph { reason: String },

    #[error("Invalid session plan: {reason}")]
    InvalidPlan { reason: String },

    #[error("Admission denied: {0}")]
    AdmissionDenied(#[from] AdmissionError),

    #[error("Failed to launch agent {agent_id}: {source}")]
    LaunchFailed {
        agent_id: AgentId,
        #[source]
        source: LaunchError,
    },

    #[error("Agent {agent_id} crashed after {uptime_secs}s")]
    AgentCrashed { agent_id: AgentId, uptime_secs: u64 },

    #[error("Recovery of session {session_id} is indeterminate: {reason}")]
    RecoveryIndeterminate { session_id: SessionId, reason: String },

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Agent {agent_id} not found in session {session_id}")]
    AgentNotFound {
        session_id: SessionId,
        agent_id: AgentId,
    },

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Checkpoint store error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Orchestrator is no longer running")]
    OrchestratorUnavailable,
}

impl OrchestrationError {
    pub fn invalid_graph(reason: impl Into<String>) -> Self {
        Self::InvalidDependencyGraph {
            reason: reason.into(),
        }
    }

    pub fn invalid_plan(reason: impl Into<String>) -> Self {
        Self::InvalidPlan {
            reason: reason.into(),
        }
    }

    /// Transient errors may succeed if the same request is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AdmissionDenied(_))
    }
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;
