//! Startup recovery of interrupted sessions.
//!
//! Recovery first computes a [`RecoveryPlan`] from the latest checkpoint and a liveness
//! check, then applies it. Planning is pure; applying it uses the checkpoint's capture
//! time for every timestamp it writes, so recovering the same checkpoint twice gives the
//! same state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::snapshot::{Checkpoint, CheckpointReason, SessionSnapshot};
use super::store::CheckpointStore;
use crate::agents::lifecycle::AgentLifecycleManager;
use crate::errors::{OrchestrationError, Result};
use crate::events::{EventKind, EventLog};
use crate::model::{
    AgentId, AgentState, ExecutionStrategy, ExitSignal, PhaseId, PhaseState, Session, SessionId,
    SessionState,
};
use crate::session::runtime::SessionRuntime;

/// Recovery actions in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    ResumeAgent,
    RestartPhase,
    ResumeSession,
    MarkFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub action: RecoveryAction,
    pub agent_id: Option<AgentId>,
    pub phase_id: Option<PhaseId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Running agents whose process is still alive; supervision resumes.
    pub reattach: Vec<AgentId>,
    pub resume: Vec<AgentId>,
    pub restart_phase: Option<PhaseId>,
    /// Live processes inside the restarted phase, killed before the reset.
    pub terminate: Vec<AgentId>,
    pub mark_failed: Vec<AgentId>,
    pub resume_session: bool,
}

impl RecoveryPlan {
    pub fn compute(snapshot: &SessionSnapshot, alive: &HashSet<AgentId>) -> Self {
        let mut plan = Self {
            resume_session: !snapshot.session.state.is_terminal(),
            ..Self::default()
        };

        for agent in &snapshot.agents {
            match agent.state {
                AgentState::Running if alive.contains(&agent.id) => {
                    plan.reattach.push(agent.id.clone())
                }
                AgentState::Running | AgentState::Resumable => {
                    if agent.resume_token.is_some() {
                        plan.resume.push(agent.id.clone());
                    } else {
                        plan.mark_failed.push(agent.id.clone());
                    }
                }
                _ => {}
            }
        }

        if snapshot.session.strategy == ExecutionStrategy::Pipeline {
            let broken_phase = snapshot.phases.iter().find(|phase| {
                phase.state == PhaseState::Running
                    && phase.agents.iter().any(|id| plan.mark_failed.contains(id))
            });
            if let Some(phase) = broken_phase {
                let members: HashSet<&AgentId> = phase.agents.iter().collect();
                plan.terminate = plan
                    .reattach
                    .iter()
                    .filter(|id| members.contains(id))
                    .cloned()
                    .collect();
                plan.reattach.retain(|id| !members.contains(id));
                plan.resume.retain(|id| !members.contains(id));
                plan.mark_failed.retain(|id| !members.contains(id));
                plan.restart_phase = Some(phase.id.clone());
            }
        }
        plan
    }

    /// Decisions in priority order, as published on the event stream.
    pub fn steps(&self) -> Vec<RecoveryStep> {
        let mut steps: Vec<RecoveryStep> = self
            .resume
            .iter()
            .map(|id| RecoveryStep {
                action: RecoveryAction::ResumeAgent,
                agent_id: Some(id.clone()),
                phase_id: None,
            })
            .collect();
        if let Some(phase_id) = &self.restart_phase {
            steps.push(RecoveryStep {
                action: RecoveryAction::RestartPhase,
                agent_id: None,
                phase_id: Some(phase_id.clone()),
            });
        }
        if self.resume_session {
            steps.push(RecoveryStep {
                action: RecoveryAction::ResumeSession,
                agent_id: None,
                phase_id: None,
            });
        }
        steps.extend(self.mark_failed.iter().map(|id| RecoveryStep {
            action: RecoveryAction::MarkFailed,
            agent_id: Some(id.clone()),
            phase_id: None,
        }));
        steps
    }

    /// True when recovery changes nothing beyond re-attaching supervision.
    pub fn is_clean(&self) -> bool {
        self.resume.is_empty() && self.restart_phase.is_none() && self.mark_failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub session_id: SessionId,
    pub checkpoint_timestamp: u64,
    pub session_state: SessionState,
    pub steps: Vec<RecoveryStep>,
    pub reattached: Vec<AgentId>,
}

pub struct RecoveryManager {
    store: Arc<dyn CheckpointStore>,
    history_limit: usize,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn CheckpointStore>, history_limit: usize) -> Self {
        Self {
            store,
            history_limit,
        }
    }

    /// Rebuilds one session from its latest valid checkpoint. A session with no readable
    /// checkpoint is recorded as `Failed` and reported as indeterminate.
    pub async fn recover_session(
        &self,
        session_id: &SessionId,
        lifecycle: &mut AgentLifecycleManager,
        events: &mut EventLog,
    ) -> Result<(SessionRuntime, RecoveryReport)> {
        let Some(checkpoint) = self.store.load_latest_checkpoint(session_id).await? else {
            return Err(self.mark_indeterminate(session_id, events).await);
        };
        let snapshot = match checkpoint.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Checkpoint has no usable snapshot");
                return Err(self.mark_indeterminate(session_id, events).await);
            }
        };
        events.advance_past(checkpoint.logical_timestamp);

        let mut alive = HashSet::new();
        for agent in &snapshot.agents {
            if agent.state != AgentState::Running {
                continue;
            }
            if let Some(handle) = &agent.process {
                if lifecycle.launcher().is_alive(handle).await {
                    alive.insert(agent.id.clone());
                }
            }
        }

        let plan = RecoveryPlan::compute(&snapshot, &alive);
        if !plan.is_clean() {
            self.save_before_recovery(&snapshot, checkpoint.logical_timestamp)
                .await;
        }

        let mut runtime = SessionRuntime::from_snapshot(snapshot, self.history_limit);
        self.apply(&plan, &mut runtime, lifecycle, events, checkpoint.taken_at)
            .await?;

        let report = RecoveryReport {
            session_id: session_id.clone(),
            checkpoint_timestamp: checkpoint.logical_timestamp,
            session_state: runtime.state(),
            steps: plan.steps(),
            reattached: plan.reattach.clone(),
        };
        info!(
            session_id = %session_id,
            checkpoint = checkpoint.logical_timestamp,
            reattached = report.reattached.len(),
            resumed = plan.resume.len(),
            failed = plan.mark_failed.len(),
            restarted_phase = ?plan.restart_phase,
            "Session recovered"
        );
        Ok((runtime, report))
    }

    async fn apply(
        &self,
        plan: &RecoveryPlan,
        runtime: &mut SessionRuntime,
        lifecycle: &mut AgentLifecycleManager,
        events: &mut EventLog,
        taken_at: DateTime<Utc>,
    ) -> Result<()> {
        for step in plan.steps() {
            runtime.emit_recovery(
                events,
                EventKind::RecoveryDecision {
                    agent_id: step.agent_id,
                    phase_id: step.phase_id,
                    action: step.action,
                },
            );
        }

        let session_id = runtime.session_id().clone();
        for agent_id in &plan.reattach {
            lifecycle.adopt(&session_id, runtime.agent(agent_id)?);
        }

        for agent_id in &plan.terminate {
            if let Some(handle) = runtime.agent(agent_id)?.process.clone() {
                if let Err(e) = lifecycle.launcher().terminate(&handle, true).await {
                    warn!(agent_id = %agent_id, error = %e, "Failed to kill agent of restarted phase");
                }
            }
        }

        if let Some(phase_id) = &plan.restart_phase {
            let members = runtime
                .phases()
                .iter()
                .find(|phase| &phase.id == phase_id)
                .map(|phase| phase.agents.clone())
                .unwrap_or_default();
            for agent_id in &members {
                runtime.reset_agent(events, agent_id)?;
            }
        }

        // Runtime resumes spent before the crash do not count against recovery
        for agent_id in &plan.resume {
            let agent = runtime.agent_mut(agent_id)?;
            agent.resume_attempts = 0;
            if agent.state == AgentState::Running {
                agent.process = None;
                runtime.transition_agent(events, agent_id, AgentState::Resumable, None)?;
            }
        }

        for agent_id in &plan.mark_failed {
            let agent = runtime.agent_mut(agent_id)?;
            agent.completed_at = Some(taken_at);
            runtime.transition_agent(events, agent_id, AgentState::Failed, Some(ExitSignal::Lost))?;
        }
        Ok(())
    }

    async fn save_before_recovery(&self, snapshot: &SessionSnapshot, logical_timestamp: u64) {
        let saved = match Checkpoint::capture(snapshot, logical_timestamp, CheckpointReason::BeforeRecovery) {
            Ok(checkpoint) => self.store.save_checkpoint(&checkpoint).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            error!(session_id = %snapshot.session.id, error = %e, "Failed to write pre-recovery checkpoint");
        }
    }

    async fn mark_indeterminate(
        &self,
        session_id: &SessionId,
        events: &EventLog,
    ) -> OrchestrationError {
        let reason = "no readable checkpoint".to_string();
        error!(session_id = %session_id, "Recovery indeterminate, marking session failed");

        let mut metadata = BTreeMap::new();
        metadata.insert("recovery".to_string(), "indeterminate".to_string());
        let mut session = Session::new(
            session_id.clone(),
            String::new(),
            ExecutionStrategy::default(),
            metadata,
        );
        session.state = SessionState::Failed;
        session.completed_at = Some(Utc::now());
        let snapshot = SessionSnapshot {
            session,
            agents: Vec::new(),
            phases: Vec::new(),
        };
        let saved = match Checkpoint::capture(&snapshot, events.last_sequence(), CheckpointReason::Recovered) {
            Ok(checkpoint) => self.store.save_checkpoint(&checkpoint).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            error!(session_id = %session_id, error = %e, "Failed to record indeterminate session");
        }

        OrchestrationError::RecoveryIndeterminate {
            session_id: session_id.clone(),
            reason,
        }
    }
}
