use std::collections::HashMap;

use crate::model::{Agent, AgentId, AgentState, ExecutionStrategy, Phase};

/// Read-only view over one session's agents and phases.
pub struct ScheduleView<'a> {
    strategy: ExecutionStrategy,
    agents: &'a [Agent],
    phases: &'a [Phase],
    states: HashMap<&'a AgentId, AgentState>,
}

impl<'a> ScheduleView<'a> {
    pub fn new(strategy: ExecutionStrategy, agents: &'a [Agent], phases: &'a [Phase]) -> Self {
        let states = agents.iter().map(|agent| (&agent.id, agent.state)).collect();
        Self {
            strategy,
            agents,
            phases,
            states,
        }
    }

    fn state_of(&self, id: &AgentId) -> Option<AgentState> {
        self.states.get(id).copied()
    }

    fn dependencies_completed(&self, agent: &Agent) -> bool {
        agent
            .dependencies
            .iter()
            .all(|dep| self.state_of(dep) == Some(AgentState::Completed))
    }

    /// Agents that may start right now, in registration order.
    pub fn eligible(&self) -> Vec<AgentId> {
        match self.strategy {
            ExecutionStrategy::Parallel | ExecutionStrategy::Adaptive => self
                .agents
                .iter()
                .filter(|agent| {
                    agent.state == AgentState::Pending && self.dependencies_completed(agent)
                })
                .map(|agent| agent.id.clone())
                .collect(),
            ExecutionStrategy::Sequential => self
                .agents
                .iter()
                .find(|agent| !agent.state.is_terminal())
                .filter(|agent| agent.state == AgentState::Pending)
                .map(|agent| vec![agent.id.clone()])
                .unwrap_or_default(),
            ExecutionStrategy::Pipeline => match self.open_phase() {
                Some(phase) => phase
                    .agents
                    .iter()
                    .filter_map(|id| self.agents.iter().find(|agent| &agent.id == id))
                    .filter(|agent| {
                        agent.state == AgentState::Pending && self.dependencies_completed(agent)
                    })
                    .map(|agent| agent.id.clone())
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    /// First phase whose agents have not all completed. Every earlier phase finished
    /// without failures, so this is the only phase allowed to run.
    pub fn open_phase(&self) -> Option<&'a Phase> {
        self.phases.iter().find(|phase| {
            phase
                .agents
                .iter()
                .any(|id| self.state_of(id) != Some(AgentState::Completed))
        })
    }

    /// Pending agents that can never start, each paired with the failed agent at the root
    /// of its blockage.
    pub fn blocked(&self) -> Vec<(AgentId, AgentId)> {
        if self.strategy == ExecutionStrategy::Sequential {
            return Vec::new();
        }

        let mut root_cause: HashMap<&AgentId, &AgentId> = self
            .agents
            .iter()
            .filter(|agent| matches!(agent.state, AgentState::Failed | AgentState::Cancelled))
            .map(|agent| (&agent.id, &agent.id))
            .collect();

        loop {
            let mut changed = false;
            for agent in self.agents {
                if agent.state != AgentState::Pending || root_cause.contains_key(&agent.id) {
                    continue;
                }
                let cause = agent
                    .dependencies
                    .iter()
                    .find_map(|dep| root_cause.get(dep).copied());
                if let Some(cause) = cause {
                    root_cause.insert(&agent.id, cause);
                    changed = true;
                }
            }

            if self.strategy == ExecutionStrategy::Pipeline {
                changed |= self.block_later_phases(&mut root_cause);
            }

            if !changed {
                break;
            }
        }

        self.agents
            .iter()
            .filter(|agent| agent.state == AgentState::Pending)
            .filter_map(|agent| {
                root_cause
                    .get(&agent.id)
                    .map(|cause| (agent.id.clone(), (*cause).clone()))
            })
            .collect()
    }

    /// A phase containing a doomed agent can never complete, so every pending agent in a
    /// later phase is doomed by the same cause.
    fn block_later_phases(&self, root_cause: &mut HashMap<&'a AgentId, &'a AgentId>) -> bool {
        let mut changed = false;
        let mut inherited: Option<&'a AgentId> = None;
        for phase in self.phases {
            if let Some(cause) = inherited {
                for id in &phase.agents {
                    if self.state_of(id) == Some(AgentState::Pending)
                        && !root_cause.contains_key(id)
                    {
                        root_cause.insert(id, cause);
                        changed = true;
                    }
                }
            } else {
                inherited = phase
                    .agents
                    .iter()
                    .find_map(|id| root_cause.get(id).copied());
            }
        }
        changed
    }

    /// True while some agent is active or could still become eligible.
    pub fn progress_possible(&self) -> bool {
        let active = self
            .agents
            .iter()
            .any(|agent| matches!(agent.state, AgentState::Running | AgentState::Resumable));
        if active {
            return true;
        }
        let pending = self
            .agents
            .iter()
            .filter(|agent| agent.state == AgentState::Pending)
            .count();
        pending > self.blocked().len()
    }
}
