//! Shared harness for orchestrator integration tests: a scripted launcher, an in-memory
//! checkpoint store and fast supervision intervals.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use agent_conductor::checkpoint::SessionSnapshot;
use agent_conductor::{
    AgentId, AgentState, CheckpointStore, MemoryStore, Orchestrator, OrchestratorSettings,
    ScriptedLauncher, SessionId, SessionState, ShutdownMode,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

pub fn fast_settings() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::default();
    settings.lifecycle.health_interval = Duration::from_millis(10);
    settings.lifecycle.poll_jitter = Duration::ZERO;
    settings.lifecycle.termination_poll = Duration::from_millis(5);
    settings.shutdown_timeout = Duration::from_millis(200);
    settings.channel_capacity = 256;
    settings
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub launcher: Arc<ScriptedLauncher>,
    pub store: Arc<MemoryStore>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: OrchestratorSettings) -> Self {
        Self::with_parts(
            settings,
            Arc::new(ScriptedLauncher::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    pub fn with_parts(
        settings: OrchestratorSettings,
        launcher: Arc<ScriptedLauncher>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let store_dyn: Arc<dyn CheckpointStore> = store.clone();
        let (orchestrator, task) = Orchestrator::spawn(settings, launcher.clone(), store_dyn);
        Self {
            orchestrator,
            launcher,
            store,
            task,
        }
    }

    pub async fn status(&self, session_id: &SessionId) -> SessionSnapshot {
        self.orchestrator.get_status(session_id).await.unwrap()
    }

    pub async fn agent_state(&self, session_id: &SessionId, agent_id: &str) -> AgentState {
        agent_in(&self.status(session_id).await, agent_id).state
    }

    /// Polls until the session reaches `state`, failing the test after a few seconds.
    pub async fn wait_for_session(&self, session_id: &SessionId, state: SessionState) -> SessionSnapshot {
        let orchestrator = self.orchestrator.clone();
        let session_id = session_id.clone();
        tokio::time::timeout(WAIT_LIMIT, async move {
            loop {
                let snapshot = orchestrator.get_status(&session_id).await.unwrap();
                if snapshot.session.state == state {
                    return snapshot;
                }
                tokio::time::sleep(POLL).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {state}"))
    }

    pub async fn wait_for_agent(&self, session_id: &SessionId, agent_id: &str, state: AgentState) {
        let orchestrator = self.orchestrator.clone();
        let session_id = session_id.clone();
        let agent_id = agent_id.to_string();
        let label = agent_id.clone();
        tokio::time::timeout(WAIT_LIMIT, async move {
            loop {
                let snapshot = orchestrator.get_status(&session_id).await.unwrap();
                if agent_in(&snapshot, &agent_id).state == state {
                    return;
                }
                tokio::time::sleep(POLL).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{label} never reached {state}"))
    }

    pub async fn stop(self) {
        self.orchestrator.shutdown(ShutdownMode::Detach).await.unwrap();
        self.task.await.unwrap();
    }
}

pub fn agent_in<'a>(snapshot: &'a SessionSnapshot, agent_id: &str) -> &'a agent_conductor::Agent {
    snapshot
        .agents
        .iter()
        .find(|agent| agent.id.as_str() == agent_id)
        .unwrap_or_else(|| panic!("no agent {agent_id} in snapshot"))
}

pub fn id(agent_id: &str) -> AgentId {
    AgentId::from(agent_id)
}

/// Every counter invariant the session record promises.
pub fn assert_counters(snapshot: &SessionSnapshot) {
    let session = &snapshot.session;
    assert!(session.counters_consistent(), "counters out of range: {session:?}");
    assert_eq!(session.agent_count, snapshot.agents.len());
    let completed = snapshot
        .agents
        .iter()
        .filter(|agent| agent.state == AgentState::Completed)
        .count();
    let failed = snapshot
        .agents
        .iter()
        .filter(|agent| agent.state == AgentState::Failed)
        .count();
    assert_eq!(session.completed_count, completed);
    assert_eq!(session.failed_count, failed);
}
