//! Agent Lifecycle Manager
//!
//! Owns the life of each worker process: admission, launch, health supervision,
//! completion, interruption and graceful or forced termination. Every operation runs on
//! the orchestrator task and mutates agents only through [`SessionRuntime`].

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::launcher::{LaunchError, LaunchRequest, Launched, ProcessLauncher};
use super::resource_limiter::{Reservation, ResourceLimiter};
use super::supervisor::{Observation, SupervisionSettings, Supervisor, SupervisorReport};
use crate::config::{ConductorConfig, RoleProfile};
use crate::errors::{OrchestrationError, Result};
use crate::events::EventLog;
use crate::model::{
    is_valid_role_name, Agent, AgentId, AgentSpec, AgentState, ExitSignal, ProcessHandle,
    SessionId,
};
use crate::session::runtime::SessionRuntime;

type AgentKey = (SessionId, AgentId);

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub workspace_root: PathBuf,
    pub default_memory_mb: u64,
    pub roles: HashMap<String, RoleProfile>,
    pub health_interval: Duration,
    pub poll_jitter: Duration,
    /// How often liveness is re-checked while waiting out a graceful termination
    pub termination_poll: Duration,
    pub max_resume_attempts: u32,
}

impl LifecycleSettings {
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self {
            workspace_root: config.launcher.workspace_root.clone(),
            default_memory_mb: config.limits.default_agent_memory_mb,
            roles: config.roles.clone(),
            health_interval: config.supervision.health_interval(),
            poll_jitter: Duration::from_millis(config.supervision.poll_jitter_ms),
            termination_poll: Duration::from_millis(50),
            max_resume_attempts: config.supervision.max_resume_attempts,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&ConductorConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyTerminal,
    /// No process existed (pending or interrupted agent).
    Cancelled,
    Terminated { forced: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub cancelled: Vec<AgentId>,
    pub forced: Vec<AgentId>,
    pub failures: Vec<(AgentId, String)>,
}

impl ShutdownSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct AgentLifecycleManager {
    launcher: Arc<dyn ProcessLauncher>,
    limiter: Arc<ResourceLimiter>,
    settings: LifecycleSettings,
    reports: mpsc::UnboundedSender<SupervisorReport>,
    reservations: HashMap<AgentKey, Reservation>,
    supervisors: HashMap<AgentKey, Supervisor>,
}

impl AgentLifecycleManager {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        limiter: Arc<ResourceLimiter>,
        settings: LifecycleSettings,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> Self {
        Self {
            launcher,
            limiter,
            settings,
            reports,
            reservations: HashMap::new(),
            supervisors: HashMap::new(),
        }
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    pub fn limiter(&self) -> &Arc<ResourceLimiter> {
        &self.limiter
    }

    pub fn memory_for(&self, role: &str, requested: Option<u64>) -> u64 {
        requested
            .or_else(|| self.settings.roles.get(role).and_then(|p| p.memory_mb))
            .unwrap_or(self.settings.default_memory_mb)
    }

    /// Rejects specs that could never be admitted, so sessions cannot stall forever.
    pub fn validate_spec(&self, spec: &AgentSpec) -> Result<()> {
        if !is_valid_role_name(&spec.role) {
            return Err(OrchestrationError::invalid_plan(format!(
                "invalid role name '{}'",
                spec.role
            )));
        }
        let limits = self.limiter.limits();
        let memory = self.memory_for(&spec.role, spec.memory_mb);
        if memory > limits.memory_budget_mb {
            return Err(OrchestrationError::invalid_plan(format!(
                "role {} needs {memory}MB, more than the {}MB budget",
                spec.role, limits.memory_budget_mb
            )));
        }
        if limits.role_cap(&spec.role) == 0 || limits.max_active_agents == 0 {
            return Err(OrchestrationError::invalid_plan(format!(
                "role {} can never be admitted",
                spec.role
            )));
        }
        Ok(())
    }

    /// Admits, registers and launches a new agent in one step. Nothing is registered
    /// when admission is denied.
    pub async fn spawn(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        spec: AgentSpec,
    ) -> Result<AgentId> {
        self.validate_spec(&spec)?;
        let memory = self.memory_for(&spec.role, spec.memory_mb);
        let reservation = self.limiter.try_admit(&spec.role, memory)?;
        let agent_id = match rt.register_agent(events, spec, memory) {
            Ok(agent_id) => agent_id,
            Err(e) => {
                self.limiter.release(reservation);
                return Err(e);
            }
        };
        self.start_admitted(rt, events, &agent_id, reservation, None)
            .await?;
        Ok(agent_id)
    }

    /// Starts an already registered `Pending` agent.
    pub async fn start(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
    ) -> Result<()> {
        let agent = rt.agent(agent_id)?;
        if agent.state != AgentState::Pending {
            return Err(OrchestrationError::InvalidTransition {
                entity: agent_id.to_string(),
                from: agent.state.to_string(),
                to: AgentState::Running.to_string(),
            });
        }
        let reservation = self.limiter.try_admit(&agent.role, agent.memory_mb)?;
        self.start_admitted(rt, events, agent_id, reservation, None)
            .await
    }

    /// Relaunches a `Resumable` agent with its token. Admission denial leaves it
    /// `Resumable`; a failed or exhausted resume marks it `Failed`.
    pub async fn resume(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
    ) -> Result<()> {
        let agent = rt.agent(agent_id)?;
        let (Some(token), AgentState::Resumable) = (agent.resume_token.clone(), agent.state)
        else {
            return Err(OrchestrationError::InvalidTransition {
                entity: agent_id.to_string(),
                from: agent.state.to_string(),
                to: AgentState::Running.to_string(),
            });
        };

        if agent.resume_attempts >= self.settings.max_resume_attempts {
            let reason = format!("{} resume attempts exhausted", agent.resume_attempts);
            rt.agent_mut(agent_id)?.completed_at = Some(Utc::now());
            rt.transition_agent(
                events,
                agent_id,
                AgentState::Failed,
                Some(ExitSignal::ResumeFailed {
                    reason: reason.clone(),
                }),
            )?;
            return Err(OrchestrationError::LaunchFailed {
                agent_id: agent_id.clone(),
                source: LaunchError::ResumeRejected(reason),
            });
        }

        let reservation = self.limiter.try_admit(&agent.role, agent.memory_mb)?;
        rt.agent_mut(agent_id)?.resume_attempts += 1;
        self.start_admitted(rt, events, agent_id, reservation, Some(token))
            .await
    }

    async fn start_admitted(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
        reservation: Reservation,
        resume_token: Option<String>,
    ) -> Result<()> {
        let resuming = resume_token.is_some();
        let request = self.launch_request(rt.session_id(), rt.agent(agent_id)?, resume_token);

        match self.launcher.launch(&request).await {
            Ok(launched) => {
                // From here the reservation belongs to the agent and leaves through `release`
                let session_id = rt.session_id().clone();
                self.reservations
                    .insert((session_id.clone(), agent_id.clone()), reservation);

                if let Err(e) = Self::record_launch(rt, events, agent_id, &launched) {
                    self.release(&session_id, agent_id);
                    if let Err(kill) = self.launcher.terminate(&launched.handle, true).await {
                        warn!(agent_id = %agent_id, error = %kill, "Failed to kill unrecorded agent process");
                    }
                    return Err(e);
                }
                self.supervise(&session_id, rt.agent(agent_id)?, launched.handle);
                Ok(())
            }
            Err(source) => {
                self.limiter.release(reservation);
                error!(
                    session_id = %rt.session_id(),
                    agent_id = %agent_id,
                    error = %source,
                    resuming = resuming,
                    "Agent launch failed"
                );
                let reason = source.to_string();
                let exit = if resuming {
                    ExitSignal::ResumeFailed { reason }
                } else {
                    ExitSignal::LaunchFailed { reason }
                };
                rt.agent_mut(agent_id)?.completed_at = Some(Utc::now());
                rt.transition_agent(events, agent_id, AgentState::Failed, Some(exit))?;
                Err(OrchestrationError::LaunchFailed {
                    agent_id: agent_id.clone(),
                    source,
                })
            }
        }
    }

    fn record_launch(
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
        launched: &Launched,
    ) -> Result<()> {
        rt.transition_agent(events, agent_id, AgentState::Running, None)?;
        let agent = rt.agent_mut(agent_id)?;
        agent.process = Some(launched.handle.clone());
        if launched.resume_token.is_some() {
            agent.resume_token = launched.resume_token.clone();
        }
        agent.started_at = Some(Utc::now());
        Ok(())
    }

    fn launch_request(
        &self,
        session_id: &SessionId,
        agent: &Agent,
        resume_token: Option<String>,
    ) -> LaunchRequest {
        let workspace = self
            .settings
            .workspace_root
            .join(session_id.as_str())
            .join(agent.id.as_str());

        let mut env = BTreeMap::new();
        env.insert("CONDUCTOR_SESSION_ID".to_string(), session_id.to_string());
        env.insert("CONDUCTOR_AGENT_ID".to_string(), agent.id.to_string());
        env.insert("CONDUCTOR_ROLE".to_string(), agent.role.clone());
        env.insert("CONDUCTOR_TASK".to_string(), agent.task.clone());
        env.insert(
            "CONDUCTOR_WORKSPACE".to_string(),
            workspace.display().to_string(),
        );
        if let Some(token) = &resume_token {
            env.insert("CONDUCTOR_RESUME_TOKEN".to_string(), token.clone());
        }

        LaunchRequest {
            session_id: session_id.clone(),
            agent_id: agent.id.clone(),
            role: agent.role.clone(),
            task: agent.task.clone(),
            workspace,
            env,
            resume_token,
        }
    }

    fn supervise(&mut self, session_id: &SessionId, agent: &Agent, handle: ProcessHandle) {
        let timeout = self
            .settings
            .roles
            .get(&agent.role)
            .and_then(|profile| profile.timeout_secs)
            .map(Duration::from_secs);
        let supervisor = Supervisor::spawn(
            self.launcher.clone(),
            session_id.clone(),
            agent.id.clone(),
            handle,
            SupervisionSettings {
                interval: self.settings.health_interval,
                jitter: self.settings.poll_jitter,
                timeout,
            },
            self.reports.clone(),
        );
        if let Some(previous) = self
            .supervisors
            .insert((session_id.clone(), agent.id.clone()), supervisor)
        {
            previous.stop();
        }
    }

    fn stop_supervisor(&mut self, session_id: &SessionId, agent_id: &AgentId) {
        if let Some(supervisor) = self
            .supervisors
            .remove(&(session_id.clone(), agent_id.clone()))
        {
            supervisor.stop();
        }
    }

    fn release(&mut self, session_id: &SessionId, agent_id: &AgentId) {
        if let Some(reservation) = self
            .reservations
            .remove(&(session_id.clone(), agent_id.clone()))
        {
            self.limiter.release(reservation);
        }
    }

    /// Records a voluntary exit. Exit code 0 completes the agent; anything else fails it.
    pub fn report_completion(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
        exit_code: i32,
    ) -> Result<bool> {
        self.finish(rt, events, agent_id, ExitSignal::Exited { code: exit_code })
    }

    /// Moves an agent to its terminal state. Returns `false` when it was already terminal.
    pub fn finish(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
        exit: ExitSignal,
    ) -> Result<bool> {
        let state = rt.agent(agent_id)?.state;
        if state.is_terminal() {
            debug!(agent_id = %agent_id, state = %state, "Ignoring completion for finished agent");
            return Ok(false);
        }
        let target = if exit.is_success() {
            AgentState::Completed
        } else {
            AgentState::Failed
        };
        if !state.can_transition_to(target) {
            return Err(OrchestrationError::InvalidTransition {
                entity: agent_id.to_string(),
                from: state.to_string(),
                to: target.to_string(),
            });
        }

        let session_id = rt.session_id().clone();
        self.stop_supervisor(&session_id, agent_id);
        self.release(&session_id, agent_id);
        rt.agent_mut(agent_id)?.completed_at = Some(Utc::now());
        rt.transition_agent(events, agent_id, target, Some(exit))?;
        Ok(true)
    }

    /// Applies a supervisor observation. Stale reports (the agent has since moved on to
    /// another process or finished) are ignored.
    pub async fn handle_report(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        report: SupervisorReport,
    ) -> Result<()> {
        let agent = rt.agent(&report.agent_id)?;
        if agent.state != AgentState::Running || agent.process.as_ref() != Some(&report.handle) {
            debug!(agent_id = %report.agent_id, "Dropping stale supervisor report");
            return Ok(());
        }
        self.supervisors
            .remove(&(report.session_id.clone(), report.agent_id.clone()));

        match report.observation {
            Observation::Exited { code } => {
                self.report_completion(rt, events, &report.agent_id, code)?;
                Ok(())
            }
            Observation::Vanished { uptime } => {
                let uptime_secs = uptime.as_secs();
                self.finish(
                    rt,
                    events,
                    &report.agent_id,
                    ExitSignal::Crashed { uptime_secs },
                )?;
                Err(OrchestrationError::AgentCrashed {
                    agent_id: report.agent_id,
                    uptime_secs,
                })
            }
            Observation::TimedOut { after } => {
                self.interrupt(rt, events, &report.agent_id, &report.handle, after)
                    .await
            }
        }
    }

    /// Kills an agent that outlived its runtime limit, then resumes it if it holds a token.
    async fn interrupt(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
        handle: &ProcessHandle,
        after: Duration,
    ) -> Result<()> {
        warn!(
            session_id = %rt.session_id(),
            agent_id = %agent_id,
            after_secs = after.as_secs(),
            "Agent exceeded its runtime limit"
        );
        if let Err(e) = self.launcher.terminate(handle, true).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to kill timed out agent");
        }
        let session_id = rt.session_id().clone();
        self.release(&session_id, agent_id);

        if rt.agent(agent_id)?.resume_token.is_none() {
            rt.agent_mut(agent_id)?.completed_at = Some(Utc::now());
            rt.transition_agent(
                events,
                agent_id,
                AgentState::Failed,
                Some(ExitSignal::TimedOut {
                    after_secs: after.as_secs(),
                }),
            )?;
            return Ok(());
        }

        rt.agent_mut(agent_id)?.process = None;
        rt.transition_agent(events, agent_id, AgentState::Resumable, None)?;
        match self.resume(rt, events, agent_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                info!(agent_id = %agent_id, "Resume deferred until capacity frees up");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stops one agent: polite termination first, forced after `timeout`. Always releases
    /// the agent's reservation and marks it `Cancelled` unless it was already terminal.
    pub async fn shutdown(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        agent_id: &AgentId,
        timeout: Duration,
    ) -> Result<ShutdownOutcome> {
        let agent = rt.agent(agent_id)?;
        if agent.state.is_terminal() {
            return Ok(ShutdownOutcome::AlreadyTerminal);
        }
        let handle = match agent.state {
            AgentState::Running => agent.process.clone(),
            _ => None,
        };

        let session_id = rt.session_id().clone();
        self.stop_supervisor(&session_id, agent_id);

        let outcome = match &handle {
            Some(handle) => {
                let forced = match terminate_gracefully(
                    self.launcher.as_ref(),
                    handle,
                    timeout,
                    self.settings.termination_poll,
                )
                .await
                {
                    Ok(forced) => forced,
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "Termination reported an error");
                        true
                    }
                };
                ShutdownOutcome::Terminated { forced }
            }
            None => ShutdownOutcome::Cancelled,
        };

        self.release(&session_id, agent_id);
        let forced = matches!(outcome, ShutdownOutcome::Terminated { forced: true });
        rt.agent_mut(agent_id)?.completed_at = Some(Utc::now());
        rt.transition_agent(
            events,
            agent_id,
            AgentState::Cancelled,
            Some(ExitSignal::Cancelled { forced }),
        )?;
        Ok(outcome)
    }

    /// Shuts down every non-terminal agent of the session concurrently. Individual
    /// failures are collected; the sweep never stops early.
    pub async fn shutdown_all(
        &mut self,
        rt: &mut SessionRuntime,
        events: &mut EventLog,
        timeout: Duration,
    ) -> ShutdownSummary {
        let session_id = rt.session_id().clone();
        let targets: Vec<(AgentId, Option<ProcessHandle>)> = rt
            .agents()
            .iter()
            .filter(|agent| !agent.state.is_terminal())
            .map(|agent| {
                let handle = match agent.state {
                    AgentState::Running => agent.process.clone(),
                    _ => None,
                };
                (agent.id.clone(), handle)
            })
            .collect();

        for (agent_id, _) in &targets {
            self.stop_supervisor(&session_id, agent_id);
        }

        let launcher = self.launcher.clone();
        let poll = self.settings.termination_poll;
        let terminations = targets.iter().map(|(_, handle)| {
            let launcher = launcher.clone();
            async move {
                match handle {
                    Some(handle) => {
                        Some(terminate_gracefully(launcher.as_ref(), handle, timeout, poll).await)
                    }
                    None => None,
                }
            }
        });
        let outcomes = join_all(terminations).await;

        let mut summary = ShutdownSummary::default();
        for ((agent_id, _), outcome) in targets.iter().zip(outcomes) {
            let forced = match outcome {
                Some(Ok(forced)) => forced,
                Some(Err(e)) => {
                    summary.failures.push((agent_id.clone(), e.to_string()));
                    true
                }
                None => false,
            };
            if forced {
                summary.forced.push(agent_id.clone());
            }

            self.release(&session_id, agent_id);
            let result = rt.agent_mut(agent_id).map(|agent| agent.completed_at = Some(Utc::now()));
            let result = result.and_then(|()| {
                rt.transition_agent(
                    events,
                    agent_id,
                    AgentState::Cancelled,
                    Some(ExitSignal::Cancelled { forced }),
                )
            });
            match result {
                Ok(()) => summary.cancelled.push(agent_id.clone()),
                Err(e) => summary.failures.push((agent_id.clone(), e.to_string())),
            }
        }

        info!(
            session_id = %session_id,
            cancelled = summary.cancelled.len(),
            forced = summary.forced.len(),
            failures = summary.failures.len(),
            "Session agents shut down"
        );
        summary
    }

    /// Re-attaches a running agent found alive during recovery: restores its reservation
    /// without admission checks and restarts supervision.
    pub fn adopt(&mut self, session_id: &SessionId, agent: &Agent) {
        let Some(handle) = agent.process.clone() else {
            return;
        };
        let reservation = self.limiter.restore(&agent.role, agent.memory_mb);
        self.reservations
            .insert((session_id.clone(), agent.id.clone()), reservation);
        self.supervise(session_id, agent, handle);
    }

    /// Stops supervising a session's agents and drops their reservations without
    /// touching the processes.
    pub fn detach_session(&mut self, session_id: &SessionId) {
        let keys: Vec<AgentKey> = self
            .supervisors
            .keys()
            .chain(self.reservations.keys())
            .filter(|(session, _)| session == session_id)
            .cloned()
            .collect();
        for (session, agent) in keys {
            self.stop_supervisor(&session, &agent);
            self.release(&session, &agent);
        }
    }

    pub fn supervised_count(&self) -> usize {
        self.supervisors.len()
    }
}

/// Asks the process to stop, waits up to `grace`, then kills it. Returns whether the kill
/// was needed.
pub async fn terminate_gracefully(
    launcher: &dyn ProcessLauncher,
    handle: &ProcessHandle,
    grace: Duration,
    poll: Duration,
) -> std::result::Result<bool, LaunchError> {
    if let Err(e) = launcher.terminate(handle, false).await {
        warn!(handle = %handle, error = %e, "Graceful termination request failed");
    }

    let exited = tokio::time::timeout(grace, async {
        while launcher.is_alive(handle).await {
            tokio::time::sleep(poll).await;
        }
    })
    .await
    .is_ok();

    if exited {
        return Ok(false);
    }
    warn!(handle = %handle, grace_ms = grace.as_millis() as u64, "Grace period expired, killing process");
    launcher.terminate(handle, true).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::launcher::{MockProcessLauncher, ScriptedLauncher};
    use crate::agents::resource_limiter::ResourceLimits;
    use crate::model::{ExecutionStrategy, SessionPlan};
    use mockall::predicate::eq;

    fn manager(
        launcher: Arc<dyn ProcessLauncher>,
        limits: ResourceLimits,
    ) -> (AgentLifecycleManager, mpsc::UnboundedReceiver<SupervisorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = AgentLifecycleManager::new(
            launcher,
            Arc::new(ResourceLimiter::new(limits)),
            LifecycleSettings::default(),
            tx,
        );
        (manager, rx)
    }

    fn runtime() -> SessionRuntime {
        let plan = SessionPlan::new("test objective", ExecutionStrategy::Adaptive);
        SessionRuntime::from_plan(SessionId::from("sess_test"), plan, |_, _| 256, 100).unwrap()
    }

    #[tokio::test]
    async fn spawn_allocates_monotonic_instances() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (mut manager, _rx) = manager(launcher.clone(), ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);

        let first = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "api"))
            .await
            .unwrap();
        let second = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "ui"))
            .await
            .unwrap();

        assert_eq!(first.as_str(), "engineer-1");
        assert_eq!(second.as_str(), "engineer-2");
        assert_eq!(rt.agent(&second).unwrap().state, AgentState::Running);
        assert_eq!(manager.limiter().usage().active_agents, 2);

        let env = &launcher.launches()[0].env;
        assert_eq!(env["CONDUCTOR_SESSION_ID"], "sess_test");
        assert_eq!(env["CONDUCTOR_ROLE"], "engineer");
    }

    #[tokio::test]
    async fn admission_denial_registers_nothing() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let limits = ResourceLimits {
            max_active_agents: 1,
            ..ResourceLimits::default()
        };
        let (mut manager, _rx) = manager(launcher, limits);
        let mut rt = runtime();
        let mut events = EventLog::new(64);

        manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "api"))
            .await
            .unwrap();
        let err = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("qa", "test"))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::AdmissionDenied(_)));
        assert_eq!(rt.agents().len(), 1);
        assert_eq!(rt.session().agent_count, 1);
    }

    #[tokio::test]
    async fn launch_failure_marks_agent_failed_and_frees_capacity() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher.fail_launches_for("qa");
        let (mut manager, _rx) = manager(launcher, ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);

        let err = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("qa", "test"))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::LaunchFailed { .. }));
        let agent = rt.agent(&AgentId::from("qa-1")).unwrap();
        assert_eq!(agent.state, AgentState::Failed);
        assert!(matches!(agent.exit, Some(ExitSignal::LaunchFailed { .. })));
        assert_eq!(manager.limiter().usage().active_agents, 0);
    }

    #[tokio::test]
    async fn unrecordable_launch_is_killed_and_its_slot_freed() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (mut manager, _rx) = manager(launcher.clone(), ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);
        let id = rt
            .register_agent(&mut events, AgentSpec::new("engineer", "api"), 256)
            .unwrap();
        // Completed agents cannot move to Running, so the launch cannot be recorded
        rt.agent_mut(&id).unwrap().state = AgentState::Completed;

        let reservation = manager.limiter().try_admit("engineer", 256).unwrap();
        assert_eq!(manager.limiter().usage().active_agents, 1);
        let err = manager
            .start_admitted(&mut rt, &mut events, &id, reservation, None)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
        assert_eq!(manager.limiter().usage().active_agents, 0);
        assert_eq!(manager.limiter().usage().reserved_memory_mb, 0);
        assert_eq!(launcher.terminations(), vec![(id.clone(), true)]);
        assert_eq!(manager.supervised_count(), 0);
        assert!(rt.agent(&id).unwrap().process.is_none());
    }

    #[tokio::test]
    async fn completion_releases_quota_and_is_idempotent() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (mut manager, _rx) = manager(launcher, ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);
        let id = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "api"))
            .await
            .unwrap();

        assert!(manager.report_completion(&mut rt, &mut events, &id, 1).unwrap());
        assert!(!manager.report_completion(&mut rt, &mut events, &id, 0).unwrap());

        let agent = rt.agent(&id).unwrap();
        assert_eq!(agent.state, AgentState::Failed);
        assert_eq!(agent.exit, Some(ExitSignal::Exited { code: 1 }));
        assert_eq!(rt.session().failed_count, 1);
        assert_eq!(manager.limiter().usage().active_agents, 0);
        assert_eq!(manager.supervised_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_forces_after_grace_period() {
        let mut mock = MockProcessLauncher::new();
        mock.expect_launch().returning(|_| {
            Ok(Launched {
                handle: ProcessHandle::new("mock:1", Some(4242)),
                resume_token: None,
            })
        });
        mock.expect_is_alive().returning(|_| true);
        mock.expect_exit_status().returning(|_| None);
        mock.expect_terminate()
            .with(mockall::predicate::always(), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_terminate()
            .with(mockall::predicate::always(), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));

        let (mut manager, _rx) = manager(Arc::new(mock), ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);
        let id = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "api"))
            .await
            .unwrap();

        let outcome = manager
            .shutdown(&mut rt, &mut events, &id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, ShutdownOutcome::Terminated { forced: true });
        assert_eq!(rt.agent(&id).unwrap().state, AgentState::Cancelled);

        let again = manager
            .shutdown(&mut rt, &mut events, &id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(again, ShutdownOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn vanished_process_becomes_crash() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (mut manager, _rx) = manager(launcher, ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);
        let id = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "api"))
            .await
            .unwrap();
        let handle = rt.agent(&id).unwrap().process.clone().unwrap();

        let err = manager
            .handle_report(
                &mut rt,
                &mut events,
                SupervisorReport {
                    session_id: SessionId::from("sess_test"),
                    agent_id: id.clone(),
                    handle,
                    observation: Observation::Vanished {
                        uptime: Duration::from_secs(42),
                    },
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestrationError::AgentCrashed { uptime_secs: 42, .. }
        ));
        let agent = rt.agent(&id).unwrap();
        assert_eq!(agent.state, AgentState::Failed);
        assert_eq!(agent.exit, Some(ExitSignal::Crashed { uptime_secs: 42 }));
    }

    #[tokio::test]
    async fn timeout_with_token_resumes_in_place() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher.issue_resume_tokens(true);
        let (mut manager, _rx) = manager(launcher.clone(), ResourceLimits::default());
        let mut rt = runtime();
        let mut events = EventLog::new(64);
        let id = manager
            .spawn(&mut rt, &mut events, AgentSpec::new("engineer", "api"))
            .await
            .unwrap();
        let handle = rt.agent(&id).unwrap().process.clone().unwrap();

        manager
            .handle_report(
                &mut rt,
                &mut events,
                SupervisorReport {
                    session_id: SessionId::from("sess_test"),
                    agent_id: id.clone(),
                    handle: handle.clone(),
                    observation: Observation::TimedOut {
                        after: Duration::from_secs(7200),
                    },
                },
            )
            .await
            .unwrap();

        let agent = rt.agent(&id).unwrap();
        assert_eq!(agent.state, AgentState::Running);
        assert_eq!(agent.resume_attempts, 1);
        assert_ne!(agent.process.as_ref(), Some(&handle));

        let launches = launcher.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(
            launches[1].env.get("CONDUCTOR_RESUME_TOKEN").map(String::as_str),
            Some("resume-engineer-1")
        );
    }
}
