//! The orchestrator actor.
//!
//! One task owns every [`SessionRuntime`], the event log and the lifecycle manager. Callers
//! talk to it through the cloneable [`Orchestrator`] handle: each request is a command on
//! an mpsc queue answered over a oneshot channel. Supervisor reports arrive on a second
//! queue. After every command or report the task runs a scheduling pass over all
//! running sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::runtime::SessionRuntime;
use super::state_machine::SessionEvent;
use crate::agents::launcher::ProcessLauncher;
use crate::agents::lifecycle::{
    AgentLifecycleManager, LifecycleSettings, ShutdownOutcome, ShutdownSummary,
};
use crate::agents::resource_limiter::{ResourceLimiter, ResourceLimits, ResourceUsage};
use crate::agents::supervisor::SupervisorReport;
use crate::checkpoint::{
    Checkpoint, CheckpointReason, CheckpointStore, RecoveryManager, RecoveryReport,
    SessionSnapshot,
};
use crate::config::ConductorConfig;
use crate::errors::{OrchestrationError, Result};
use crate::events::{EventLog, OrchestrationEvent};
use crate::model::{
    AgentId, AgentSpec, AgentState, ExecutionStrategy, SessionId, SessionPlan, SessionState,
};
use crate::telemetry::create_orchestration_span;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lifecycle: LifecycleSettings,
    pub limits: ResourceLimits,
    /// Grace period for cancellations and agent shutdowns without an explicit timeout
    pub shutdown_timeout: Duration,
    pub history_limit: usize,
    pub channel_capacity: usize,
    pub keep_checkpoints: usize,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            lifecycle: LifecycleSettings::from_config(config),
            limits: config.resource_limits(),
            shutdown_timeout: config.supervision.shutdown_timeout(),
            history_limit: config.events.history_limit,
            channel_capacity: config.events.channel_capacity,
            keep_checkpoints: config.checkpoints.keep_per_session,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&ConductorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop supervising and checkpoint every session; worker processes keep running and
    /// are picked up by the next `recover`.
    Detach,
    /// Cancel every non-terminal session.
    CancelAll,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub recovered: Vec<RecoveryReport>,
    pub indeterminate: Vec<SessionId>,
    pub errors: Vec<(SessionId, String)>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    CreateSession {
        plan: SessionPlan,
        reply: Reply<SessionId>,
    },
    Transition {
        session_id: SessionId,
        event: SessionEvent,
        reply: Reply<()>,
    },
    CancelSession {
        session_id: SessionId,
        reply: Reply<ShutdownSummary>,
    },
    Status {
        session_id: SessionId,
        reply: Reply<SessionSnapshot>,
    },
    SpawnAgent {
        session_id: SessionId,
        spec: AgentSpec,
        reply: Reply<AgentId>,
    },
    ReportCompletion {
        session_id: SessionId,
        agent_id: AgentId,
        exit_code: i32,
        reply: Reply<()>,
    },
    RecordResumeToken {
        session_id: SessionId,
        agent_id: AgentId,
        token: String,
        reply: Reply<()>,
    },
    ShutdownAgent {
        session_id: SessionId,
        agent_id: AgentId,
        timeout: Option<Duration>,
        reply: Reply<ShutdownOutcome>,
    },
    Recover {
        reply: Reply<RecoverySummary>,
    },
    EventHistory {
        session_id: SessionId,
        reply: Reply<Vec<OrchestrationEvent>>,
    },
    Usage {
        reply: Reply<ResourceUsage>,
    },
    Shutdown {
        mode: ShutdownMode,
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    fn span(&self) -> tracing::Span {
        let (operation, session_id, agent_id) = match self {
            Self::CreateSession { .. } => ("create_session", None, None),
            Self::Transition {
                session_id, event, ..
            } => (
                match event {
                    SessionEvent::Start => "start_session",
                    SessionEvent::Pause => "pause_session",
                    SessionEvent::Resume => "resume_session",
                    _ => "transition_session",
                },
                Some(session_id),
                None,
            ),
            Self::CancelSession { session_id, .. } => ("cancel_session", Some(session_id), None),
            Self::Status { session_id, .. } => ("get_status", Some(session_id), None),
            Self::SpawnAgent { session_id, .. } => ("spawn_agent", Some(session_id), None),
            Self::ReportCompletion {
                session_id,
                agent_id,
                ..
            } => ("report_completion", Some(session_id), Some(agent_id)),
            Self::RecordResumeToken {
                session_id,
                agent_id,
                ..
            } => ("record_resume_token", Some(session_id), Some(agent_id)),
            Self::ShutdownAgent {
                session_id,
                agent_id,
                ..
            } => ("shutdown_agent", Some(session_id), Some(agent_id)),
            Self::Recover { .. } => ("recover", None, None),
            Self::EventHistory { session_id, .. } => ("event_history", Some(session_id), None),
            Self::Usage { .. } => ("usage", None, None),
            Self::Shutdown { .. } => ("shutdown", None, None),
        };
        create_orchestration_span(
            operation,
            session_id.map(SessionId::as_str),
            agent_id.map(AgentId::as_str),
        )
    }
}

/// Handle to the orchestrator task.
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<OrchestrationEvent>,
}

impl Orchestrator {
    pub fn spawn(
        settings: OrchestratorSettings,
        launcher: Arc<dyn ProcessLauncher>,
        store: Arc<dyn CheckpointStore>,
    ) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let events = EventLog::new(settings.channel_capacity);
        let event_tx = events.sender();
        let limiter = Arc::new(ResourceLimiter::new(settings.limits.clone()));
        let lifecycle =
            AgentLifecycleManager::new(launcher, limiter, settings.lifecycle.clone(), report_tx);

        let task = OrchestratorTask {
            sessions: HashMap::new(),
            order: Vec::new(),
            events,
            lifecycle,
            recovery: RecoveryManager::new(store.clone(), settings.history_limit),
            store,
            settings,
        };
        let join = tokio::spawn(task.run(command_rx, report_rx));

        (
            Self {
                commands: command_tx,
                events: event_tx,
            },
            join,
        )
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| OrchestrationError::OrchestratorUnavailable)?;
        response
            .await
            .map_err(|_| OrchestrationError::OrchestratorUnavailable)?
    }

    /// Live event stream. Late subscribers should read `event_history` first.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.events.subscribe()
    }

    pub async fn create_session(&self, plan: SessionPlan) -> Result<SessionId> {
        self.request(|reply| Command::CreateSession { plan, reply })
            .await
    }

    async fn transition(&self, session_id: &SessionId, event: SessionEvent) -> Result<()> {
        let session_id = session_id.clone();
        self.request(|reply| Command::Transition {
            session_id,
            event,
            reply,
        })
        .await
    }

    pub async fn start_session(&self, session_id: &SessionId) -> Result<()> {
        self.transition(session_id, SessionEvent::Start).await
    }

    pub async fn pause_session(&self, session_id: &SessionId) -> Result<()> {
        self.transition(session_id, SessionEvent::Pause).await
    }

    pub async fn resume_session(&self, session_id: &SessionId) -> Result<()> {
        self.transition(session_id, SessionEvent::Resume).await
    }

    pub async fn cancel_session(&self, session_id: &SessionId) -> Result<ShutdownSummary> {
        let session_id = session_id.clone();
        self.request(|reply| Command::CancelSession { session_id, reply })
            .await
    }

    pub async fn get_status(&self, session_id: &SessionId) -> Result<SessionSnapshot> {
        let session_id = session_id.clone();
        self.request(|reply| Command::Status { session_id, reply })
            .await
    }

    pub async fn spawn_agent(&self, session_id: &SessionId, spec: AgentSpec) -> Result<AgentId> {
        let session_id = session_id.clone();
        self.request(|reply| Command::SpawnAgent {
            session_id,
            spec,
            reply,
        })
        .await
    }

    pub async fn report_completion(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        exit_code: i32,
    ) -> Result<()> {
        let (session_id, agent_id) = (session_id.clone(), agent_id.clone());
        self.request(|reply| Command::ReportCompletion {
            session_id,
            agent_id,
            exit_code,
            reply,
        })
        .await
    }

    pub async fn record_resume_token(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        token: impl Into<String>,
    ) -> Result<()> {
        let (session_id, agent_id, token) = (session_id.clone(), agent_id.clone(), token.into());
        self.request(|reply| Command::RecordResumeToken {
            session_id,
            agent_id,
            token,
            reply,
        })
        .await
    }

    pub async fn shutdown_agent(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        timeout: Option<Duration>,
    ) -> Result<ShutdownOutcome> {
        let (session_id, agent_id) = (session_id.clone(), agent_id.clone());
        self.request(|reply| Command::ShutdownAgent {
            session_id,
            agent_id,
            timeout,
            reply,
        })
        .await
    }

    /// Recovers every non-terminal session found in the checkpoint store.
    pub async fn recover(&self) -> Result<RecoverySummary> {
        self.request(|reply| Command::Recover { reply }).await
    }

    pub async fn event_history(&self, session_id: &SessionId) -> Result<Vec<OrchestrationEvent>> {
        let session_id = session_id.clone();
        self.request(|reply| Command::EventHistory { session_id, reply })
            .await
    }

    pub async fn resource_usage(&self) -> Result<ResourceUsage> {
        self.request(|reply| Command::Usage { reply }).await
    }

    /// Stops the orchestrator task. Requests sent afterwards fail with
    /// `OrchestratorUnavailable`.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { mode, reply })
            .await
            .map_err(|_| OrchestrationError::OrchestratorUnavailable)?;
        done.await
            .map_err(|_| OrchestrationError::OrchestratorUnavailable)
    }
}

struct OrchestratorTask {
    sessions: HashMap<SessionId, SessionRuntime>,
    /// Creation order, so scheduling passes visit sessions deterministically
    order: Vec<SessionId>,
    events: EventLog,
    lifecycle: AgentLifecycleManager,
    store: Arc<dyn CheckpointStore>,
    recovery: RecoveryManager,
    settings: OrchestratorSettings,
}

async fn persist(
    store: &dyn CheckpointStore,
    runtime: &SessionRuntime,
    logical_timestamp: u64,
    reason: CheckpointReason,
    keep: usize,
) {
    let session_id = runtime.session_id();
    let saved = match Checkpoint::capture(&runtime.snapshot(), logical_timestamp, reason) {
        Ok(checkpoint) => store.save_checkpoint(&checkpoint).await,
        Err(e) => Err(e),
    };
    match saved {
        Ok(()) => {
            if let Err(e) = store.prune(session_id, keep).await {
                warn!(session_id = %session_id, error = %e, "Checkpoint pruning failed");
            }
        }
        Err(e) => error!(session_id = %session_id, error = %e, "Checkpoint write failed"),
    }
}

impl OrchestratorTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::UnboundedReceiver<SupervisorReport>,
    ) {
        info!("Orchestrator started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { mode, reply }) => {
                        self.shutdown(mode).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => {
                        let span = command.span();
                        self.handle(command).instrument(span).await;
                    }
                    None => {
                        self.shutdown(ShutdownMode::Detach).await;
                        break;
                    }
                },
                Some(report) = reports.recv() => {
                    self.handle_report(report).await;
                }
            }
        }
        info!("Orchestrator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::CreateSession { plan, reply } => {
                let _ = reply.send(self.create_session(plan).await);
            }
            Command::Transition {
                session_id,
                event,
                reply,
            } => {
                let result = self.transition(&session_id, event).await;
                self.schedule().await;
                let _ = reply.send(result);
            }
            Command::CancelSession { session_id, reply } => {
                let result = self.cancel_session(&session_id).await;
                self.schedule().await;
                let _ = reply.send(result);
            }
            Command::Status { session_id, reply } => {
                let _ = reply.send(self.runtime(&session_id).map(SessionRuntime::snapshot));
            }
            Command::SpawnAgent {
                session_id,
                spec,
                reply,
            } => {
                let result = self.spawn_agent(&session_id, spec).await;
                self.schedule().await;
                let _ = reply.send(result);
            }
            Command::ReportCompletion {
                session_id,
                agent_id,
                exit_code,
                reply,
            } => {
                let result = self.report_completion(&session_id, &agent_id, exit_code).await;
                self.schedule().await;
                let _ = reply.send(result);
            }
            Command::RecordResumeToken {
                session_id,
                agent_id,
                token,
                reply,
            } => {
                let _ = reply.send(self.record_resume_token(&session_id, &agent_id, token).await);
            }
            Command::ShutdownAgent {
                session_id,
                agent_id,
                timeout,
                reply,
            } => {
                let result = self.shutdown_agent(&session_id, &agent_id, timeout).await;
                self.schedule().await;
                let _ = reply.send(result);
            }
            Command::Recover { reply } => {
                let result = self.recover().await;
                self.schedule().await;
                let _ = reply.send(result);
            }
            Command::EventHistory { session_id, reply } => {
                let history = self
                    .runtime(&session_id)
                    .map(|rt| rt.history().cloned().collect());
                let _ = reply.send(history);
            }
            Command::Usage { reply } => {
                let _ = reply.send(Ok(self.lifecycle.limiter().usage()));
            }
            Command::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    fn runtime(&self, session_id: &SessionId) -> Result<&SessionRuntime> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.clone()))
    }

    fn runtime_mut<'a>(
        sessions: &'a mut HashMap<SessionId, SessionRuntime>,
        session_id: &SessionId,
    ) -> Result<&'a mut SessionRuntime> {
        sessions
            .get_mut(session_id)
            .ok_or_else(|| OrchestrationError::SessionNotFound(session_id.clone()))
    }

    async fn checkpoint(&self, session_id: &SessionId, reason: CheckpointReason) {
        if let Some(runtime) = self.sessions.get(session_id) {
            persist(
                self.store.as_ref(),
                runtime,
                self.events.last_sequence(),
                reason,
                self.settings.keep_checkpoints,
            )
            .await;
        }
    }

    async fn create_session(&mut self, plan: SessionPlan) -> Result<SessionId> {
        for spec in &plan.agents {
            self.lifecycle.validate_spec(spec)?;
        }
        let session_id = SessionId::generate();
        let lifecycle = &self.lifecycle;
        let runtime = SessionRuntime::from_plan(
            session_id.clone(),
            plan,
            |role, requested| lifecycle.memory_for(role, requested),
            self.settings.history_limit,
        )?;
        info!(
            session_id = %session_id,
            strategy = %runtime.strategy(),
            agents = runtime.agents().len(),
            phases = runtime.phases().len(),
            "Session created"
        );
        self.sessions.insert(session_id.clone(), runtime);
        self.order.push(session_id.clone());
        self.checkpoint(&session_id, CheckpointReason::SessionTransition)
            .await;
        Ok(session_id)
    }

    async fn transition(&mut self, session_id: &SessionId, event: SessionEvent) -> Result<()> {
        let runtime = Self::runtime_mut(&mut self.sessions, session_id)?;
        runtime.apply_session_event(&mut self.events, event)?;
        info!(session_id = %session_id, state = %runtime.state(), "Session transitioned");
        self.checkpoint(session_id, CheckpointReason::SessionTransition)
            .await;
        Ok(())
    }

    async fn cancel_session(&mut self, session_id: &SessionId) -> Result<ShutdownSummary> {
        let runtime = Self::runtime_mut(&mut self.sessions, session_id)?;
        let state = runtime.state();
        if state.is_terminal() {
            return Err(OrchestrationError::InvalidTransition {
                entity: session_id.to_string(),
                from: state.to_string(),
                to: SessionState::Cancelled.to_string(),
            });
        }
        let summary = self
            .lifecycle
            .shutdown_all(runtime, &mut self.events, self.settings.shutdown_timeout)
            .await;
        runtime.apply_session_event(&mut self.events, SessionEvent::Cancel)?;
        info!(
            session_id = %session_id,
            cancelled = summary.cancelled.len(),
            forced = summary.forced.len(),
            "Session cancelled"
        );
        self.checkpoint(session_id, CheckpointReason::SessionTransition)
            .await;
        Ok(summary)
    }

    async fn spawn_agent(&mut self, session_id: &SessionId, spec: AgentSpec) -> Result<AgentId> {
        self.lifecycle.validate_spec(&spec)?;
        let runtime = Self::runtime_mut(&mut self.sessions, session_id)?;

        let immediate = runtime.state() == SessionState::Running
            && matches!(
                runtime.strategy(),
                ExecutionStrategy::Parallel | ExecutionStrategy::Adaptive
            )
            && spec.depends_on.iter().all(|dep| {
                runtime
                    .agent(dep)
                    .is_ok_and(|agent| agent.state == AgentState::Completed)
            });

        let result = if immediate {
            let before = runtime.agents().len();
            let result = self
                .lifecycle
                .spawn(runtime, &mut self.events, spec)
                .await;
            if runtime.agents().len() == before {
                return result;
            }
            result
        } else {
            let memory = self.lifecycle.memory_for(&spec.role, spec.memory_mb);
            runtime.register_agent(&mut self.events, spec, memory)
        };

        self.checkpoint(session_id, CheckpointReason::PlanExtended)
            .await;
        if let Ok(agent_id) = &result {
            info!(session_id = %session_id, agent_id = %agent_id, immediate, "Agent added to session");
        }
        result
    }

    async fn report_completion(
        &mut self,
        session_id: &SessionId,
        agent_id: &AgentId,
        exit_code: i32,
    ) -> Result<()> {
        let runtime = Self::runtime_mut(&mut self.sessions, session_id)?;
        let changed = self
            .lifecycle
            .report_completion(runtime, &mut self.events, agent_id, exit_code)?;
        if changed {
            self.checkpoint(session_id, CheckpointReason::AgentCompleted)
                .await;
        }
        Ok(())
    }

    async fn record_resume_token(
        &mut self,
        session_id: &SessionId,
        agent_id: &AgentId,
        token: String,
    ) -> Result<()> {
        let runtime = Self::runtime_mut(&mut self.sessions, session_id)?;
        let agent = runtime.agent_mut(agent_id)?;
        if agent.state.is_terminal() {
            return Err(OrchestrationError::InvalidTransition {
                entity: agent_id.to_string(),
                from: agent.state.to_string(),
                to: "resumable token recorded".to_string(),
            });
        }
        agent.resume_token = Some(token);
        debug!(session_id = %session_id, agent_id = %agent_id, "Resume token recorded");
        self.checkpoint(session_id, CheckpointReason::ResumeTokenRecorded)
            .await;
        Ok(())
    }

    async fn shutdown_agent(
        &mut self,
        session_id: &SessionId,
        agent_id: &AgentId,
        timeout: Option<Duration>,
    ) -> Result<ShutdownOutcome> {
        let runtime = Self::runtime_mut(&mut self.sessions, session_id)?;
        let timeout = timeout.unwrap_or(self.settings.shutdown_timeout);
        let outcome = self
            .lifecycle
            .shutdown(runtime, &mut self.events, agent_id, timeout)
            .await?;
        if outcome != ShutdownOutcome::AlreadyTerminal {
            self.checkpoint(session_id, CheckpointReason::AgentCompleted)
                .await;
        }
        Ok(outcome)
    }

    async fn recover(&mut self) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        for session_id in self.store.list_nonterminal_sessions().await? {
            if self.sessions.contains_key(&session_id) {
                debug!(session_id = %session_id, "Session already loaded, skipping recovery");
                continue;
            }
            match self
                .recovery
                .recover_session(&session_id, &mut self.lifecycle, &mut self.events)
                .await
            {
                Ok((runtime, report)) => {
                    self.sessions.insert(session_id.clone(), runtime);
                    self.order.push(session_id.clone());
                    self.checkpoint(&session_id, CheckpointReason::Recovered)
                        .await;
                    summary.recovered.push(report);
                }
                Err(OrchestrationError::RecoveryIndeterminate { session_id, .. }) => {
                    summary.indeterminate.push(session_id);
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Session recovery failed");
                    summary.errors.push((session_id, e.to_string()));
                }
            }
        }
        info!(
            recovered = summary.recovered.len(),
            indeterminate = summary.indeterminate.len(),
            errors = summary.errors.len(),
            "Recovery finished"
        );
        Ok(summary)
    }

    async fn handle_report(&mut self, report: SupervisorReport) {
        let session_id = report.session_id.clone();
        let agent_id = report.agent_id.clone();
        let Some(runtime) = self.sessions.get_mut(&session_id) else {
            debug!(session_id = %session_id, "Dropping report for unknown session");
            return;
        };
        let before = runtime.agent(&agent_id).map(|agent| agent.state).ok();

        let span = create_orchestration_span(
            "supervisor_report",
            Some(session_id.as_str()),
            Some(agent_id.as_str()),
        );
        let result = self
            .lifecycle
            .handle_report(runtime, &mut self.events, report)
            .instrument(span)
            .await;
        match result {
            Ok(()) => {}
            Err(OrchestrationError::AgentCrashed {
                agent_id,
                uptime_secs,
            }) => warn!(
                session_id = %session_id,
                agent_id = %agent_id,
                uptime_secs,
                "Agent process vanished without reporting completion"
            ),
            Err(e) => warn!(session_id = %session_id, agent_id = %agent_id, error = %e, "Supervisor report handling failed"),
        }

        let after = runtime.agent(&agent_id).map(|agent| agent.state).ok();
        if after != before {
            self.checkpoint(&session_id, CheckpointReason::AgentCompleted)
                .await;
        }
        self.schedule().await;
    }

    /// Scheduling pass over every running session. A session is revisited while its pass
    /// keeps changing agent states without starting anything (launch failures under the
    /// sequential strategy, for example).
    async fn schedule(&mut self) {
        let order = self.order.clone();
        for session_id in &order {
            while self.schedule_session(session_id).await {}
        }
    }

    /// Returns true when another pass over the same session may find new work.
    async fn schedule_session(&mut self, session_id: &SessionId) -> bool {
        let Some(runtime) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if runtime.state() != SessionState::Running {
            return false;
        }
        let mut failed_to_start = false;

        for agent_id in runtime.resumable() {
            match self
                .lifecycle
                .resume(runtime, &mut self.events, &agent_id)
                .await
            {
                Ok(()) => {}
                Err(OrchestrationError::AdmissionDenied(reason)) => {
                    runtime.note_deferred(&mut self.events, &agent_id, reason.to_string());
                }
                Err(e) => {
                    warn!(session_id = %session_id, agent_id = %agent_id, error = %e, "Resume failed");
                    failed_to_start = true;
                }
            }
        }

        for agent_id in runtime.eligible() {
            if let Some(phase_id) = runtime.phase_opened_by(&agent_id) {
                info!(session_id = %session_id, phase_id = %phase_id, "Phase starting");
                persist(
                    self.store.as_ref(),
                    runtime,
                    self.events.last_sequence(),
                    CheckpointReason::PhaseStarting,
                    self.settings.keep_checkpoints,
                )
                .await;
            }
            match self
                .lifecycle
                .start(runtime, &mut self.events, &agent_id)
                .await
            {
                Ok(()) => {}
                Err(OrchestrationError::AdmissionDenied(reason)) => {
                    debug!(session_id = %session_id, agent_id = %agent_id, reason = %reason, "Admission deferred");
                    runtime.note_deferred(&mut self.events, &agent_id, reason.to_string());
                }
                Err(e) => {
                    warn!(session_id = %session_id, agent_id = %agent_id, error = %e, "Agent failed to start");
                    failed_to_start = true;
                }
            }
        }

        if failed_to_start {
            persist(
                self.store.as_ref(),
                runtime,
                self.events.last_sequence(),
                CheckpointReason::AgentCompleted,
                self.settings.keep_checkpoints,
            )
            .await;
        }

        runtime.report_blocked(&mut self.events);
        if let Some(state) = runtime.evaluate_completion(&mut self.events) {
            info!(
                session_id = %session_id,
                state = %state,
                completed = runtime.session().completed_count,
                failed = runtime.session().failed_count,
                "Session finished"
            );
            persist(
                self.store.as_ref(),
                runtime,
                self.events.last_sequence(),
                CheckpointReason::SessionTransition,
                self.settings.keep_checkpoints,
            )
            .await;
            return false;
        }
        failed_to_start
    }

    async fn shutdown(&mut self, mode: ShutdownMode) {
        info!(mode = ?mode, sessions = self.sessions.len(), "Orchestrator shutting down");
        let order = self.order.clone();
        for session_id in &order {
            let Some(runtime) = self.sessions.get_mut(session_id) else {
                continue;
            };
            if runtime.state().is_terminal() {
                continue;
            }
            match mode {
                ShutdownMode::Detach => {
                    self.lifecycle.detach_session(session_id);
                    persist(
                        self.store.as_ref(),
                        runtime,
                        self.events.last_sequence(),
                        CheckpointReason::Shutdown,
                        self.settings.keep_checkpoints,
                    )
                    .await;
                }
                ShutdownMode::CancelAll => {
                    if let Err(e) = self.cancel_session(session_id).await {
                        error!(session_id = %session_id, error = %e, "Failed to cancel session during shutdown");
                    }
                }
            }
        }
    }
}
