use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::info;

use super::{follow_sessions, lock_state_dir, start_orchestrator};
use crate::config::ConductorConfig;
use crate::model::{SessionPlan, SessionState};
use crate::session::ShutdownMode;
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::generate_correlation_id;

pub struct RunCommand {
    pub plan: PathBuf,
    pub dry_run: bool,
}

impl RunCommand {
    pub fn new(plan: PathBuf) -> Self {
        Self {
            plan,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn execute(&self, config: &ConductorConfig) -> Result<()> {
        let correlation_id = generate_correlation_id();
        let plan = SessionPlan::from_file(&self.plan)?;
        let _lock = lock_state_dir(config)?;

        let (orchestrator, task) = start_orchestrator(config, self.dry_run);
        let events = orchestrator.subscribe();
        let session_id = orchestrator.create_session(plan).await?;
        info!(correlation_id = %correlation_id, session_id = %session_id, dry_run = self.dry_run, "Running session");
        println!("🚀 Session {session_id} created");
        orchestrator.start_session(&session_id).await?;

        let state = tokio::select! {
            finished = follow_sessions(&orchestrator, events, vec![session_id.clone()]) => {
                finished?
                    .into_iter()
                    .next()
                    .map(|(_, state)| state)
                    .ok_or_else(|| anyhow!("Session {session_id} vanished"))?
            }
            signal = ShutdownCoordinator::wait_for_signal() => {
                signal?;
                println!("🛑 Interrupted, cancelling session {session_id}...");
                let summary = orchestrator.cancel_session(&session_id).await?;
                println!(
                    "   Cancelled {} agents ({} forced)",
                    summary.cancelled.len(),
                    summary.forced.len()
                );
                SessionState::Cancelled
            }
        };

        ShutdownCoordinator::new(orchestrator.clone())
            .with_mode(ShutdownMode::Detach)
            .shutdown_now()
            .await?;
        task.await?;

        let snapshot_line = format!("Session {session_id} finished: {state}");
        match state {
            SessionState::Completed => {
                println!("✅ {snapshot_line}");
                Ok(())
            }
            _ => {
                println!("❌ {snapshot_line}");
                Err(anyhow!("session {session_id} ended {state}"))
            }
        }
    }
}
