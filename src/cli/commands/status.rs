use anyhow::{anyhow, Result};

use crate::checkpoint::{CheckpointStore, FileSystemStore};
use crate::config::ConductorConfig;
use crate::model::{AgentState, SessionId};

pub struct StatusCommand {
    pub session_id: Option<SessionId>,
}

impl StatusCommand {
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            session_id: session_id.map(SessionId::from),
        }
    }

    pub async fn execute(&self, config: &ConductorConfig) -> Result<()> {
        let store = FileSystemStore::new(config.checkpoints.directory.clone());
        let sessions = match &self.session_id {
            Some(session_id) => vec![session_id.clone()],
            None => store.list_sessions().await?,
        };

        if sessions.is_empty() {
            println!("📭 No sessions in {}", config.checkpoints.directory.display());
            return Ok(());
        }

        println!("🤖 CONDUCTOR SESSION STATUS");
        println!("===========================");
        for session_id in sessions {
            let Some(checkpoint) = store.load_latest_checkpoint(&session_id).await? else {
                if self.session_id.is_some() {
                    return Err(anyhow!("No readable checkpoint for {session_id}"));
                }
                println!();
                println!("⚠️  {session_id}: no readable checkpoint");
                continue;
            };
            let snapshot = checkpoint.snapshot()?;
            let session = &snapshot.session;

            println!();
            println!("📋 {} [{}] {}", session.id, session.state, session.objective);
            println!(
                "   Strategy: {} | agents: {} | completed: {} | failed: {}",
                session.strategy, session.agent_count, session.completed_count, session.failed_count
            );
            println!(
                "   Checkpoint {} ({:?}) at {}",
                checkpoint.logical_timestamp, checkpoint.reason, checkpoint.taken_at
            );
            for phase in &snapshot.phases {
                println!("   🔀 {} {} [{}]", phase.id, phase.name, phase.state);
            }
            for agent in &snapshot.agents {
                let marker = match agent.state {
                    AgentState::Completed => "✅",
                    AgentState::Failed => "❌",
                    AgentState::Cancelled => "🛑",
                    AgentState::Running => "🟢",
                    AgentState::Resumable => "⏸️ ",
                    AgentState::Pending => "⏳",
                };
                match &agent.exit {
                    Some(exit) => println!(
                        "   {marker} {} [{}] exit {} - {}",
                        agent.id,
                        agent.state,
                        exit.code(),
                        agent.task
                    ),
                    None => println!("   {marker} {} [{}] - {}", agent.id, agent.state, agent.task),
                }
            }
        }
        Ok(())
    }
}
