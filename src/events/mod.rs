//! Ordered orchestration event stream.
//!
//! Every state change is stamped with a sequence number from a single counter owned by the
//! orchestrator task, so all subscribers observe one global order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::checkpoint::recovery::RecoveryAction;
use crate::model::{
    AgentId, AgentState, ExitSignal, PhaseId, PhaseState, SessionId, SessionState,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SessionTransition {
        from: SessionState,
        to: SessionState,
    },
    AgentTransition {
        agent_id: AgentId,
        from: AgentState,
        to: AgentState,
        #[serde(default)]
        exit: Option<ExitSignal>,
    },
    PhaseTransition {
        phase_id: PhaseId,
        from: PhaseState,
        to: PhaseState,
    },
    /// The agent is eligible but the resource limiter had no room for it.
    AdmissionDeferred { agent_id: AgentId, reason: String },
    /// The agent can never start because something it waits on failed.
    DependencyBlocked {
        agent_id: AgentId,
        blocked_by: AgentId,
    },
    AgentRegistered { agent_id: AgentId },
    RecoveryDecision {
        #[serde(default)]
        agent_id: Option<AgentId>,
        #[serde(default)]
        phase_id: Option<PhaseId>,
        action: RecoveryAction,
    },
}

impl EventKind {
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::AgentTransition { agent_id, .. }
            | Self::AdmissionDeferred { agent_id, .. }
            | Self::DependencyBlocked { agent_id, .. }
            | Self::AgentRegistered { agent_id } => Some(agent_id),
            Self::RecoveryDecision { agent_id, .. } => agent_id.as_ref(),
            Self::SessionTransition { .. } | Self::PhaseTransition { .. } => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionTransition { from, to } => write!(f, "session {from} -> {to}"),
            Self::AgentTransition {
                agent_id, from, to, ..
            } => write!(f, "agent {agent_id} {from} -> {to}"),
            Self::PhaseTransition { phase_id, from, to } => {
                write!(f, "phase {phase_id} {from} -> {to}")
            }
            Self::AdmissionDeferred { agent_id, reason } => {
                write!(f, "agent {agent_id} deferred: {reason}")
            }
            Self::DependencyBlocked {
                agent_id,
                blocked_by,
            } => write!(f, "agent {agent_id} blocked by failed {blocked_by}"),
            Self::AgentRegistered { agent_id } => write!(f, "agent {agent_id} registered"),
            Self::RecoveryDecision {
                agent_id,
                phase_id,
                action,
            } => match (agent_id, phase_id) {
                (Some(agent), _) => write!(f, "recovery {action:?} for agent {agent}"),
                (None, Some(phase)) => write!(f, "recovery {action:?} for phase {phase}"),
                (None, None) => write!(f, "recovery {action:?}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Sequence counter plus broadcast fan-out.
#[derive(Debug)]
pub struct EventLog {
    last_sequence: u64,
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            last_sequence: 0,
            sender,
        }
    }

    pub fn sender(&self) -> broadcast::Sender<OrchestrationEvent> {
        self.sender.clone()
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Never moves the counter backwards.
    pub fn advance_past(&mut self, sequence: u64) {
        self.last_sequence = self.last_sequence.max(sequence);
    }

    pub fn record(&mut self, session_id: &SessionId, kind: EventKind) -> OrchestrationEvent {
        self.last_sequence += 1;
        let event = OrchestrationEvent {
            sequence: self.last_sequence,
            timestamp: Utc::now(),
            session_id: session_id.clone(),
            kind,
        };

        info!(
            sequence = event.sequence,
            session_id = %event.session_id,
            agent_id = event.kind.agent_id().map(|id| id.as_str()),
            "{}",
            event.kind
        );

        if self.sender.send(event.clone()).is_err() {
            debug!(sequence = event.sequence, "No event subscribers");
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_numbers_increase_across_sessions() {
        let mut log = EventLog::new(16);
        let mut rx = log.sender().subscribe();
        let a = SessionId::from("sess_a");
        let b = SessionId::from("sess_b");

        log.record(
            &a,
            EventKind::SessionTransition {
                from: SessionState::Created,
                to: SessionState::Running,
            },
        );
        log.record(
            &b,
            EventKind::AgentRegistered {
                agent_id: AgentId::from("engineer-1"),
            },
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.session_id, b);
    }

    #[test]
    fn advance_past_never_rewinds() {
        let mut log = EventLog::new(4);
        log.advance_past(40);
        log.advance_past(12);
        let event = log.record(
            &SessionId::from("sess_a"),
            EventKind::AgentRegistered {
                agent_id: AgentId::from("qa-1"),
            },
        );
        assert_eq!(event.sequence, 41);
    }
}
