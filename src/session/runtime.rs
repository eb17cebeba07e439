//! In-memory state of one session: the session record, its agents in registration order,
//! its phases, and the lifecycle machine. Only the orchestrator task holds a
//! `SessionRuntime`, so every mutation here is single-writer.

use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};

use super::state_machine::{SessionEvent, SessionStateMachine};
use crate::checkpoint::snapshot::SessionSnapshot;
use crate::errors::{OrchestrationError, Result};
use crate::events::{EventKind, EventLog, OrchestrationEvent};
use crate::model::{
    Agent, AgentId, AgentSpec, AgentState, ExecutionStrategy, ExitSignal, Phase, PhaseId,
    PhaseState, Session, SessionId, SessionPlan, SessionState,
};
use crate::scheduler::{self, Node, ScheduleView};

pub struct SessionRuntime {
    session: Session,
    agents: Vec<Agent>,
    phases: Vec<Phase>,
    lifecycle: SessionStateMachine,
    instances: HashMap<String, u32>,
    blocked_reported: HashSet<AgentId>,
    deferred: HashSet<AgentId>,
    history: VecDeque<OrchestrationEvent>,
    history_limit: usize,
}

impl SessionRuntime {
    /// Builds a session from a plan, registering every agent as `Pending`. Fails with
    /// `InvalidDependencyGraph` or `InvalidPlan` before anything exists.
    pub fn from_plan<F>(
        session_id: SessionId,
        plan: SessionPlan,
        memory_for: F,
        history_limit: usize,
    ) -> Result<Self>
    where
        F: Fn(&str, Option<u64>) -> u64,
    {
        let mut phases: Vec<Phase> = Vec::with_capacity(plan.phases.len());
        for (index, spec) in plan.phases.iter().enumerate() {
            if phases.iter().any(|phase| phase.name == spec.name) {
                return Err(OrchestrationError::invalid_plan(format!(
                    "duplicate phase name '{}'",
                    spec.name
                )));
            }
            phases.push(Phase::planned(
                PhaseId::at(index + 1),
                spec.name.clone(),
                spec.artifacts.clone(),
            ));
        }

        let mut runtime = Self {
            session: Session::new(session_id, plan.objective, plan.strategy, plan.metadata),
            agents: Vec::with_capacity(plan.agents.len()),
            phases,
            lifecycle: SessionStateMachine::new(),
            instances: HashMap::new(),
            blocked_reported: HashSet::new(),
            deferred: HashSet::new(),
            history: VecDeque::new(),
            history_limit,
        };

        for spec in plan.agents {
            let memory = memory_for(&spec.role, spec.memory_mb);
            runtime.push_agent(spec, memory)?;
        }
        runtime.validate_graph()?;
        Ok(runtime)
    }

    /// Rebuilds a runtime from a checkpointed snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot, history_limit: usize) -> Self {
        let mut instances: HashMap<String, u32> = HashMap::new();
        for agent in &snapshot.agents {
            let instance = agent.id.instance().unwrap_or(0);
            let entry = instances.entry(agent.role.clone()).or_insert(0);
            *entry = (*entry).max(instance);
        }
        Self {
            lifecycle: SessionStateMachine::restore(snapshot.session.state),
            session: snapshot.session,
            agents: snapshot.agents,
            phases: snapshot.phases,
            instances,
            blocked_reported: HashSet::new(),
            deferred: HashSet::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            agents: self.agents.clone(),
            phases: self.phases.clone(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.session.strategy
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn history(&self) -> impl Iterator<Item = &OrchestrationEvent> {
        self.history.iter()
    }

    pub fn agent(&self, agent_id: &AgentId) -> Result<&Agent> {
        self.agents
            .iter()
            .find(|agent| &agent.id == agent_id)
            .ok_or_else(|| self.missing(agent_id))
    }

    pub fn agent_mut(&mut self, agent_id: &AgentId) -> Result<&mut Agent> {
        let session_id = &self.session.id;
        self.agents
            .iter_mut()
            .find(|agent| &agent.id == agent_id)
            .ok_or_else(|| OrchestrationError::AgentNotFound {
                session_id: session_id.clone(),
                agent_id: agent_id.clone(),
            })
    }

    fn missing(&self, agent_id: &AgentId) -> OrchestrationError {
        OrchestrationError::AgentNotFound {
            session_id: self.session.id.clone(),
            agent_id: agent_id.clone(),
        }
    }

    fn emit(&mut self, events: &mut EventLog, kind: EventKind) {
        let event = events.record(&self.session.id, kind);
        if self.history_limit > 0 {
            if self.history.len() == self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(event);
        }
    }

    fn phase_id_for(&self, name: Option<&str>) -> Result<Option<PhaseId>> {
        match name {
            None => Ok(None),
            Some(name) => self
                .phases
                .iter()
                .find(|phase| phase.name == name)
                .map(|phase| Some(phase.id.clone()))
                .ok_or_else(|| {
                    OrchestrationError::invalid_plan(format!("unknown phase '{name}'"))
                }),
        }
    }

    fn push_agent(&mut self, spec: AgentSpec, memory_mb: u64) -> Result<AgentId> {
        let phase = self.phase_id_for(spec.phase.as_deref())?;
        let instance = self.instances.entry(spec.role.clone()).or_insert(0);
        *instance += 1;
        let agent_id = AgentId::new(&spec.role, *instance);

        if let Some(phase_id) = &phase {
            if let Some(phase) = self.phases.iter_mut().find(|p| &p.id == phase_id) {
                phase.agents.push(agent_id.clone());
            }
        }
        self.agents.push(Agent::pending(
            agent_id.clone(),
            spec.role,
            spec.task,
            spec.depends_on,
            phase,
            memory_mb,
        ));
        self.session.agent_count = self.agents.len();
        Ok(agent_id)
    }

    fn validate_graph(&self) -> Result<()> {
        let nodes: Vec<Node<'_>> = self
            .agents
            .iter()
            .map(|agent| Node {
                id: &agent.id,
                dependencies: &agent.dependencies,
                phase: agent.phase.as_ref(),
            })
            .collect();
        let phase_order: Vec<PhaseId> = self.phases.iter().map(|phase| phase.id.clone()).collect();
        scheduler::validate(
            &nodes,
            &phase_order,
            self.session.strategy == ExecutionStrategy::Pipeline,
        )
    }

    /// Extends the plan with one more `Pending` agent. Under the pipeline strategy an agent
    /// without a phase joins the last phase. The instance number is consumed even if
    /// validation fails, so ids are never reused.
    pub fn register_agent(
        &mut self,
        events: &mut EventLog,
        mut spec: AgentSpec,
        memory_mb: u64,
    ) -> Result<AgentId> {
        if self.session.state.is_terminal() {
            return Err(OrchestrationError::InvalidTransition {
                entity: self.session.id.to_string(),
                from: self.session.state.to_string(),
                to: "extended".to_string(),
            });
        }
        if spec.phase.is_none() && self.session.strategy == ExecutionStrategy::Pipeline {
            spec.phase = self.phases.last().map(|phase| phase.name.clone());
        }

        let agent_id = self.push_agent(spec, memory_mb)?;
        if let Err(e) = self.validate_graph() {
            self.agents.pop();
            for phase in &mut self.phases {
                phase.agents.retain(|id| id != &agent_id);
            }
            self.session.agent_count = self.agents.len();
            return Err(e);
        }

        self.emit(
            events,
            EventKind::AgentRegistered {
                agent_id: agent_id.clone(),
            },
        );
        self.refresh_phases(events);
        Ok(agent_id)
    }

    /// Applies an ordinary lifecycle edge, then refreshes counters and phases.
    pub fn transition_agent(
        &mut self,
        events: &mut EventLog,
        agent_id: &AgentId,
        to: AgentState,
        exit: Option<ExitSignal>,
    ) -> Result<()> {
        let agent = self.agent_mut(agent_id)?;
        let from = agent.state;
        if !from.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                entity: agent_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        agent.state = to;
        if exit.is_some() {
            agent.exit = exit.clone();
        }
        if to == AgentState::Pending {
            agent.resume_token = None;
        }
        if to != AgentState::Pending && to != AgentState::Resumable {
            self.deferred.remove(agent_id);
        }

        self.recount();
        self.emit(
            events,
            EventKind::AgentTransition {
                agent_id: agent_id.clone(),
                from,
                to,
                exit,
            },
        );
        self.refresh_phases(events);
        Ok(())
    }

    /// Returns an agent to `Pending` whatever its state, discarding its process, token
    /// and exit signal. Only phase restarts use this.
    pub fn reset_agent(&mut self, events: &mut EventLog, agent_id: &AgentId) -> Result<()> {
        let agent = self.agent_mut(agent_id)?;
        let from = agent.state;
        agent.reset();
        self.blocked_reported.remove(agent_id);
        self.recount();
        if from != AgentState::Pending {
            self.emit(
                events,
                EventKind::AgentTransition {
                    agent_id: agent_id.clone(),
                    from,
                    to: AgentState::Pending,
                    exit: None,
                },
            );
        }
        self.refresh_phases(events);
        Ok(())
    }

    fn recount(&mut self) {
        self.session.agent_count = self.agents.len();
        self.session.completed_count = self
            .agents
            .iter()
            .filter(|agent| agent.state == AgentState::Completed)
            .count();
        self.session.failed_count = self
            .agents
            .iter()
            .filter(|agent| agent.state == AgentState::Failed)
            .count();
    }

    pub fn apply_session_event(&mut self, events: &mut EventLog, event: SessionEvent) -> Result<()> {
        let Some((from, to)) = self.lifecycle.apply(event) else {
            return Err(OrchestrationError::InvalidTransition {
                entity: self.session.id.to_string(),
                from: self.session.state.to_string(),
                to: format!("{event:?}").to_lowercase(),
            });
        };
        self.session.state = to;
        let now = Utc::now();
        if to == SessionState::Running && self.session.started_at.is_none() {
            self.session.started_at = Some(now);
        }
        if to.is_terminal() {
            self.session.completed_at = Some(now);
        }
        self.emit(events, EventKind::SessionTransition { from, to });
        self.refresh_phases(events);
        Ok(())
    }

    fn desired_phase_state(&self, phase: &Phase) -> PhaseState {
        let states: Vec<AgentState> = phase
            .agents
            .iter()
            .filter_map(|id| self.agent(id).ok().map(|agent| agent.state))
            .collect();
        let session_state = self.session.state;

        if states.is_empty() {
            return match session_state {
                SessionState::Created => PhaseState::Planned,
                SessionState::Failed | SessionState::Cancelled => PhaseState::Skipped,
                _ => PhaseState::Completed,
            };
        }
        if states.iter().all(|state| *state == AgentState::Completed) {
            return PhaseState::Completed;
        }
        if states.iter().all(|state| state.is_terminal()) {
            return PhaseState::Failed;
        }
        if states.iter().all(|state| *state == AgentState::Pending) {
            return if session_state.is_terminal() {
                PhaseState::Skipped
            } else {
                PhaseState::Planned
            };
        }
        if session_state.is_terminal() {
            PhaseState::Failed
        } else {
            PhaseState::Running
        }
    }

    fn refresh_phases(&mut self, events: &mut EventLog) {
        for index in 0..self.phases.len() {
            let desired = self.desired_phase_state(&self.phases[index]);
            let phase = &mut self.phases[index];
            if phase.state != desired {
                let from = phase.state;
                phase.state = desired;
                let phase_id = phase.id.clone();
                self.emit(
                    events,
                    EventKind::PhaseTransition {
                        phase_id,
                        from,
                        to: desired,
                    },
                );
            }
        }
    }

    fn view(&self) -> ScheduleView<'_> {
        ScheduleView::new(self.session.strategy, &self.agents, &self.phases)
    }

    /// Agents the strategy allows to start now. Empty unless the session is running.
    pub fn eligible(&self) -> Vec<AgentId> {
        if self.session.state != SessionState::Running {
            return Vec::new();
        }
        self.view().eligible()
    }

    /// Interrupted agents waiting for a resume attempt.
    pub fn resumable(&self) -> Vec<AgentId> {
        if self.session.state != SessionState::Running {
            return Vec::new();
        }
        self.agents
            .iter()
            .filter(|agent| agent.state == AgentState::Resumable)
            .map(|agent| agent.id.clone())
            .collect()
    }

    /// The phase `agent_id` would open by starting, if it has not started yet.
    pub fn phase_opened_by(&self, agent_id: &AgentId) -> Option<PhaseId> {
        let phase_id = self.agent(agent_id).ok()?.phase.as_ref()?;
        self.phases
            .iter()
            .find(|phase| &phase.id == phase_id && phase.state == PhaseState::Planned)
            .map(|phase| phase.id.clone())
    }

    /// Emits `AdmissionDeferred` the first time an agent is turned away, not on every
    /// scheduling pass.
    pub fn note_deferred(&mut self, events: &mut EventLog, agent_id: &AgentId, reason: String) {
        if self.deferred.insert(agent_id.clone()) {
            self.emit(
                events,
                EventKind::AdmissionDeferred {
                    agent_id: agent_id.clone(),
                    reason,
                },
            );
        }
    }

    /// Emits one `DependencyBlocked` event per newly stranded agent.
    pub fn report_blocked(&mut self, events: &mut EventLog) {
        let blocked = self.view().blocked();
        for (agent_id, blocked_by) in blocked {
            if self.blocked_reported.insert(agent_id.clone()) {
                self.emit(
                    events,
                    EventKind::DependencyBlocked {
                        agent_id,
                        blocked_by,
                    },
                );
            }
        }
    }

    /// Completes or fails a running session once its outcome is settled.
    pub fn evaluate_completion(&mut self, events: &mut EventLog) -> Option<SessionState> {
        if self.session.state != SessionState::Running {
            return None;
        }
        let all_terminal = self.agents.iter().all(|agent| agent.state.is_terminal());
        // Cancelled agents end cleanly; only a failed agent fails a settled session
        let event = if all_terminal {
            if self.session.failed_count == 0 {
                SessionEvent::Complete
            } else {
                SessionEvent::Fail
            }
        } else if !self.view().progress_possible() {
            SessionEvent::Fail
        } else {
            return None;
        };
        self.apply_session_event(events, event).ok()?;
        Some(self.session.state)
    }

    pub fn emit_recovery(&mut self, events: &mut EventLog, kind: EventKind) {
        self.emit(events, kind);
    }
}
