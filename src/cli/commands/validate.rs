use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::agents::ScriptedLauncher;
use crate::checkpoint::MemoryStore;
use crate::config::ConductorConfig;
use crate::model::SessionPlan;
use crate::session::{Orchestrator, OrchestratorSettings, ShutdownMode};

pub struct ValidateCommand {
    pub plan: PathBuf,
}

impl ValidateCommand {
    pub fn new(plan: PathBuf) -> Self {
        Self { plan }
    }

    /// Registers the plan with a throwaway orchestrator, which runs exactly the checks a
    /// real `create_session` would.
    pub async fn execute(&self, config: &ConductorConfig) -> Result<()> {
        let plan = SessionPlan::from_file(&self.plan)?;
        let strategy = plan.strategy;
        let agent_count = plan.agents.len();
        let phase_count = plan.phases.len();

        let (orchestrator, task) = Orchestrator::spawn(
            OrchestratorSettings::from_config(config),
            Arc::new(ScriptedLauncher::new()),
            Arc::new(MemoryStore::new()),
        );
        let result = orchestrator.create_session(plan).await;
        let snapshot = match &result {
            Ok(session_id) => Some(orchestrator.get_status(session_id).await?),
            Err(_) => None,
        };
        orchestrator.shutdown(ShutdownMode::Detach).await?;
        task.await?;

        match (result, snapshot) {
            (Ok(_), Some(snapshot)) => {
                println!("✅ Plan {} is valid", self.plan.display());
                println!("   Strategy: {strategy}");
                println!("   Agents: {agent_count}, phases: {phase_count}");
                for agent in &snapshot.agents {
                    let deps: Vec<&str> = agent.dependencies.iter().map(|d| d.as_str()).collect();
                    if deps.is_empty() {
                        println!("   • {} ({}MB)", agent.id, agent.memory_mb);
                    } else {
                        println!("   • {} ({}MB) after {}", agent.id, agent.memory_mb, deps.join(", "));
                    }
                }
                Ok(())
            }
            (Err(e), _) => {
                println!("❌ Plan {} is invalid: {e}", self.plan.display());
                Err(e.into())
            }
            (Ok(session_id), None) => Err(anyhow::anyhow!("session {session_id} disappeared")),
        }
    }
}
