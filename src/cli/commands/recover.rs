use anyhow::Result;
use tracing::info;

use super::{follow_sessions, lock_state_dir, start_orchestrator};
use crate::config::ConductorConfig;
use crate::model::SessionState;
use crate::session::ShutdownMode;
use crate::shutdown::ShutdownCoordinator;

pub struct RecoverCommand {
    pub dry_run: bool,
}

impl RecoverCommand {
    pub fn new() -> Self {
        Self { dry_run: false }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn execute(&self, config: &ConductorConfig) -> Result<()> {
        let _lock = lock_state_dir(config)?;
        let (orchestrator, task) = start_orchestrator(config, self.dry_run);
        let events = orchestrator.subscribe();

        println!("🔄 Recovering sessions from {}...", config.checkpoints.directory.display());
        let summary = orchestrator.recover().await?;
        for report in &summary.recovered {
            println!(
                "✅ {} recovered from checkpoint {} ({}), {} decisions",
                report.session_id,
                report.checkpoint_timestamp,
                report.session_state,
                report.steps.len()
            );
            for step in &report.steps {
                let target = step
                    .agent_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .or_else(|| step.phase_id.as_ref().map(|id| id.to_string()))
                    .unwrap_or_else(|| "session".to_string());
                println!("   • {:?} {target}", step.action);
            }
        }
        for session_id in &summary.indeterminate {
            println!("⚠️  {session_id} has no readable checkpoint, marked failed");
        }
        for (session_id, error) in &summary.errors {
            println!("❌ {session_id}: {error}");
        }

        // Paused and never-started sessions keep their state, so only running ones can finish
        let mut live = Vec::new();
        for report in &summary.recovered {
            match report.session_state {
                SessionState::Running => live.push(report.session_id.clone()),
                SessionState::Paused | SessionState::Created => println!(
                    "⏸️  {} left {}; resume it to continue",
                    report.session_id, report.session_state
                ),
                _ => {}
            }
        }
        info!(live = live.len(), "Supervising recovered sessions");

        if !live.is_empty() {
            tokio::select! {
                finished = follow_sessions(&orchestrator, events, live) => {
                    for (session_id, state) in finished? {
                        println!("🏁 {session_id} finished: {state}");
                    }
                }
                signal = ShutdownCoordinator::wait_for_signal() => {
                    signal?;
                    println!("🛑 Interrupted, detaching; sessions will be recovered on next start");
                }
            }
        }

        ShutdownCoordinator::new(orchestrator)
            .with_mode(ShutdownMode::Detach)
            .shutdown_now()
            .await?;
        task.await?;
        Ok(())
    }
}

impl Default for RecoverCommand {
    fn default() -> Self {
        Self::new()
    }
}
