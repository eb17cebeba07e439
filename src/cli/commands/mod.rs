use anyhow::{anyhow, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::agents::{CommandLauncher, ProcessLauncher, ScriptedLauncher};
use crate::checkpoint::{CheckpointStore, FileSystemStore};
use crate::config::ConductorConfig;
use crate::events::{EventKind, OrchestrationEvent};
use crate::model::{SessionId, SessionState};
use crate::session::{Orchestrator, OrchestratorSettings};

pub mod recover;
pub mod run;
pub mod status;
pub mod validate;

/// Simulated agents exit successfully after this long
const DRY_RUN_AGENT_DURATION: Duration = Duration::from_millis(200);

pub fn load_config(path: Option<&Path>) -> Result<ConductorConfig> {
    ConductorConfig::load_env_file()?;
    match path {
        Some(path) => ConductorConfig::load_from(path),
        None => ConductorConfig::load(),
    }
}

/// Acquire the singleton lock on the checkpoint directory so two orchestrators never
/// drive the same sessions.
pub fn lock_state_dir(config: &ConductorConfig) -> Result<RwLockWriteGuard<'static, File>> {
    std::fs::create_dir_all(&config.checkpoints.directory)?;
    let lock_file = File::create(config.checkpoints.directory.join("conductor.lock"))?;
    let lock = Box::leak(Box::new(RwLock::new(lock_file)));
    lock.try_write().map_err(|_| {
        anyhow!(
            "Another conductor is already using {}. Only one orchestrator can run at a time.",
            config.checkpoints.directory.display()
        )
    })
}

pub fn launcher_for(config: &ConductorConfig, dry_run: bool) -> Arc<dyn ProcessLauncher> {
    if dry_run {
        Arc::new(ScriptedLauncher::with_auto_exit(DRY_RUN_AGENT_DURATION))
    } else {
        Arc::new(CommandLauncher::new(
            config.launcher.program.clone(),
            config.launcher.args.clone(),
        ))
    }
}

pub fn start_orchestrator(
    config: &ConductorConfig,
    dry_run: bool,
) -> (Orchestrator, JoinHandle<()>) {
    let store: Arc<dyn CheckpointStore> =
        Arc::new(FileSystemStore::new(config.checkpoints.directory.clone()));
    Orchestrator::spawn(
        OrchestratorSettings::from_config(config),
        launcher_for(config, dry_run),
        store,
    )
}

pub fn print_event(event: &OrchestrationEvent) {
    let marker = match &event.kind {
        EventKind::SessionTransition { .. } => "📋",
        EventKind::AgentTransition { .. } | EventKind::AgentRegistered { .. } => "🤖",
        EventKind::PhaseTransition { .. } => "🔀",
        EventKind::AdmissionDeferred { .. } => "⏳",
        EventKind::DependencyBlocked { .. } => "🚫",
        EventKind::RecoveryDecision { .. } => "🔧",
    };
    println!(
        "{marker} [{:>5}] {} {}",
        event.sequence, event.session_id, event.kind
    );
}

/// Streams events until every session in `pending` has reached a terminal state.
/// Returns the final state of each session. Subscribe before triggering the work being
/// followed so no transition is missed.
pub async fn follow_sessions(
    orchestrator: &Orchestrator,
    mut events: broadcast::Receiver<OrchestrationEvent>,
    mut pending: Vec<SessionId>,
) -> Result<Vec<(SessionId, SessionState)>> {
    let mut finished = Vec::new();

    // Sessions may already be terminal before we subscribed
    for session_id in pending.clone() {
        let snapshot = orchestrator.get_status(&session_id).await?;
        if snapshot.session.state.is_terminal() {
            finished.push((session_id.clone(), snapshot.session.state));
            pending.retain(|id| id != &session_id);
        }
    }

    while !pending.is_empty() {
        match events.recv().await {
            Ok(event) => {
                print_event(&event);
                if let EventKind::SessionTransition { to, .. } = event.kind {
                    if to.is_terminal() && pending.contains(&event.session_id) {
                        pending.retain(|id| id != &event.session_id);
                        finished.push((event.session_id, to));
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                println!("⚠️  Skipped {skipped} events");
                for session_id in pending.clone() {
                    let state = orchestrator.get_status(&session_id).await?.session.state;
                    if state.is_terminal() {
                        pending.retain(|id| id != &session_id);
                        finished.push((session_id, state));
                    }
                }
            }
            Err(RecvError::Closed) => return Err(anyhow!("Orchestrator stopped unexpectedly")),
        }
    }
    Ok(finished)
}
