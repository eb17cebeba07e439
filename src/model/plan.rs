//! Session plans: the objective, strategy and agent specifications a caller submits.
//!
//! Agent ids are deterministic (`<role>-<n>` in registration order), so the builder hands
//! back the id each spec will receive and later specs can depend on it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use super::{AgentId, ExecutionStrategy};
use crate::errors::{OrchestrationError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub role: String,
    pub task: String,
    pub depends_on: Vec<AgentId>,
    /// Name of the phase the agent belongs to.
    pub phase: Option<String>,
    pub memory_mb: Option<u64>,
}

impl AgentSpec {
    pub fn new(role: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task: task.into(),
            depends_on: Vec::new(),
            phase: None,
            memory_mb: None,
        }
    }

    pub fn depends_on<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = AgentId>,
    {
        self.depends_on.extend(ids);
        self
    }

    pub fn in_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: String,
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub objective: String,
    pub strategy: ExecutionStrategy,
    pub metadata: BTreeMap<String, String>,
    pub phases: Vec<PhaseSpec>,
    pub agents: Vec<AgentSpec>,
    instances: HashMap<String, u32>,
    current_phase: Option<String>,
}

impl SessionPlan {
    pub fn new(objective: impl Into<String>, strategy: ExecutionStrategy) -> Self {
        Self {
            objective: objective.into(),
            strategy,
            metadata: BTreeMap::new(),
            phases: Vec::new(),
            agents: Vec::new(),
            instances: HashMap::new(),
            current_phase: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Declares a phase; agents added afterwards without an explicit phase join it.
    pub fn begin_phase(&mut self, name: impl Into<String>, artifacts: Vec<String>) -> &mut Self {
        let name = name.into();
        self.phases.push(PhaseSpec {
            name: name.clone(),
            artifacts,
        });
        self.current_phase = Some(name);
        self
    }

    /// Adds an agent and returns the id it will be registered under.
    pub fn agent(&mut self, mut spec: AgentSpec) -> AgentId {
        if spec.phase.is_none() {
            spec.phase = self.current_phase.clone();
        }
        let instance = self.instances.entry(spec.role.clone()).or_insert(0);
        *instance += 1;
        let id = AgentId::new(&spec.role, *instance);
        self.agents.push(spec);
        id
    }

    /// Reads a plan from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OrchestrationError::invalid_plan(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: PlanFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| OrchestrationError::invalid_plan(e.to_string()))?,
            _ => toml::from_str(&contents)
                .map_err(|e| OrchestrationError::invalid_plan(e.to_string()))?,
        };
        Ok(file.into_plan())
    }
}

/// On-disk plan layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub objective: String,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub agents: Vec<PlanAgent>,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAgent {
    pub role: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub agents: Vec<PlanAgent>,
}

impl PlanFile {
    pub fn into_plan(self) -> SessionPlan {
        let mut plan = SessionPlan::new(self.objective, self.strategy);
        plan.metadata = self.metadata;
        for agent in self.agents {
            plan.agent(agent.into_spec(None));
        }
        for phase in self.phases {
            plan.begin_phase(phase.name.clone(), phase.artifacts);
            for agent in phase.agents {
                plan.agent(agent.into_spec(Some(phase.name.clone())));
            }
        }
        plan
    }
}

impl PlanAgent {
    fn into_spec(self, phase: Option<String>) -> AgentSpec {
        AgentSpec {
            role: self.role,
            task: self.task,
            depends_on: self
                .depends_on
                .iter()
                .map(|id| AgentId::from(id.as_str()))
                .collect(),
            phase,
            memory_mb: self.memory_mb,
        }
    }
}
