//! Process launcher boundary and its two implementations.
//!
//! `CommandLauncher` runs each agent as a real OS process with tokio. `ScriptedLauncher`
//! keeps simulated processes in memory; it backs `conductor run --dry-run` and the test
//! suites.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::{AgentId, ProcessHandle, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub role: String,
    pub task: String,
    pub workspace: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Present when an interrupted agent is being resumed.
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub handle: ProcessHandle,
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("failed to prepare workspace {path}: {reason}")]
    Workspace { path: PathBuf, reason: String },

    #[error("resume rejected: {0}")]
    ResumeRejected(String),

    #[error("failed to terminate {handle}: {reason}")]
    Terminate { handle: String, reason: String },
}

/// Capability interface for creating and observing worker processes.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<Launched, LaunchError>;

    async fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// `force = false` asks the process to stop; `force = true` kills it.
    async fn terminate(&self, handle: &ProcessHandle, force: bool) -> Result<(), LaunchError>;

    /// Exit code of a process that is no longer alive, if one could be observed.
    async fn exit_status(&self, handle: &ProcessHandle) -> Option<i32>;
}

enum ChildSlot {
    Running(Child),
    Exited(Option<i32>),
}

/// Launches `program args...` in the agent workspace, passing the assignment through the
/// environment built by the lifecycle manager.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    children: tokio::sync::Mutex<HashMap<String, ChildSlot>>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn signal(pid: u32, signal: &str) -> bool {
        Command::new("kill")
            .arg(signal)
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Launched, LaunchError> {
        let workspace_error = |e: std::io::Error| LaunchError::Workspace {
            path: request.workspace.clone(),
            reason: e.to_string(),
        };
        tokio::fs::create_dir_all(&request.workspace)
            .await
            .map_err(workspace_error)?;
        let log = tokio::fs::File::create(request.workspace.join("agent.log"))
            .await
            .map_err(workspace_error)?
            .into_std()
            .await;
        let log_err = log.try_clone().map_err(workspace_error)?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&request.workspace)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| LaunchError::Spawn(format!("{}: {e}", self.program)))?;

        let pid = child.id();
        let handle = match pid {
            Some(pid) => ProcessHandle::new(format!("pid:{pid}"), Some(pid)),
            None => ProcessHandle::new(format!("proc:{}", uuid::Uuid::new_v4()), None),
        };
        info!(
            agent_id = %request.agent_id,
            handle = %handle,
            resumed = request.resume_token.is_some(),
            "Agent process spawned"
        );

        self.children
            .lock()
            .await
            .insert(handle.id.clone(), ChildSlot::Running(child));
        Ok(Launched {
            handle,
            resume_token: request.resume_token.clone(),
        })
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let mut children = self.children.lock().await;
        let polled = match children.get_mut(&handle.id) {
            Some(ChildSlot::Running(child)) => child.try_wait(),
            Some(ChildSlot::Exited(_)) => return false,
            None => {
                drop(children);
                // Adopted after a restart: we never owned the child, so check the pid directly.
                return match handle.pid {
                    Some(pid) => Self::signal(pid, "-0").await,
                    None => false,
                };
            }
        };

        match polled {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(handle = %handle, code = ?status.code(), "Agent process exited");
                children.insert(handle.id.clone(), ChildSlot::Exited(status.code()));
                false
            }
            Err(e) => {
                warn!(handle = %handle, error = %e, "Failed to poll agent process");
                false
            }
        }
    }

    async fn terminate(&self, handle: &ProcessHandle, force: bool) -> Result<(), LaunchError> {
        let mut children = self.children.lock().await;
        if let Some(ChildSlot::Running(child)) = children.get_mut(&handle.id) {
            if force || handle.pid.is_none() {
                return child.start_kill().map_err(|e| LaunchError::Terminate {
                    handle: handle.id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        drop(children);

        let Some(pid) = handle.pid else {
            return Ok(());
        };
        let signal = if force { "-KILL" } else { "-TERM" };
        if Self::signal(pid, signal).await {
            Ok(())
        } else {
            Err(LaunchError::Terminate {
                handle: handle.id.clone(),
                reason: format!("kill {signal} failed"),
            })
        }
    }

    async fn exit_status(&self, handle: &ProcessHandle) -> Option<i32> {
        match self.children.lock().await.get(&handle.id) {
            Some(ChildSlot::Exited(code)) => *code,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct SimulatedProcess {
    agent_id: AgentId,
    alive: bool,
    exit_code: Option<i32>,
    started: Instant,
}

#[derive(Debug, Default)]
struct Script {
    next_id: u64,
    processes: HashMap<String, SimulatedProcess>,
    launches: Vec<LaunchRequest>,
    terminations: Vec<(AgentId, bool)>,
    failing_roles: HashSet<String>,
    issue_tokens: bool,
    reject_resume: bool,
    ignore_graceful: bool,
    auto_exit_after: Option<Duration>,
}

/// In-memory launcher whose processes live until told otherwise.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    script: Mutex<Script>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launched process exits with code 0 once `delay` has elapsed.
    pub fn with_auto_exit(delay: Duration) -> Self {
        let launcher = Self::default();
        launcher.script().auto_exit_after = Some(delay);
        launcher
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_launches_for(&self, role: &str) {
        self.script().failing_roles.insert(role.to_string());
    }

    /// Launches return a resumability token derived from the agent id.
    pub fn issue_resume_tokens(&self, issue: bool) {
        self.script().issue_tokens = issue;
    }

    pub fn reject_resumes(&self, reject: bool) {
        self.script().reject_resume = reject;
    }

    /// Graceful termination requests are ignored, forcing the caller to kill.
    pub fn ignore_graceful_termination(&self, ignore: bool) {
        self.script().ignore_graceful = ignore;
    }

    /// The agent's current process exits with `code`.
    pub fn exit(&self, agent_id: &AgentId, code: i32) {
        self.finish(agent_id, Some(code));
    }

    /// The agent's current process disappears without an observable exit code.
    pub fn vanish(&self, agent_id: &AgentId) {
        self.finish(agent_id, None);
    }

    fn finish(&self, agent_id: &AgentId, code: Option<i32>) {
        let mut script = self.script();
        for process in script
            .processes
            .values_mut()
            .filter(|process| &process.agent_id == agent_id && process.alive)
        {
            process.alive = false;
            process.exit_code = code;
        }
    }

    /// Registers a process from an earlier orchestrator run.
    pub fn adopt(&self, handle: &ProcessHandle, agent_id: &AgentId, alive: bool) {
        self.script().processes.insert(
            handle.id.clone(),
            SimulatedProcess {
                agent_id: agent_id.clone(),
                alive,
                exit_code: None,
                started: Instant::now(),
            },
        );
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.script().launches.clone()
    }

    pub fn terminations(&self) -> Vec<(AgentId, bool)> {
        self.script().terminations.clone()
    }

    pub fn live_processes(&self) -> usize {
        self.script()
            .processes
            .values()
            .filter(|process| process.alive)
            .count()
    }

    fn refresh(script: &mut Script, handle: &ProcessHandle) {
        let Some(delay) = script.auto_exit_after else {
            return;
        };
        if let Some(process) = script.processes.get_mut(&handle.id) {
            if process.alive && process.started.elapsed() >= delay {
                process.alive = false;
                process.exit_code = Some(0);
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<Launched, LaunchError> {
        let mut script = self.script();
        script.launches.push(request.clone());

        if script.failing_roles.contains(&request.role) {
            return Err(LaunchError::Spawn(format!(
                "role {} is scripted to fail",
                request.role
            )));
        }
        if request.resume_token.is_some() && script.reject_resume {
            return Err(LaunchError::ResumeRejected(format!(
                "resume of {} rejected",
                request.agent_id
            )));
        }

        script.next_id += 1;
        let handle = ProcessHandle::new(format!("sim:{}", script.next_id), None);
        script.processes.insert(
            handle.id.clone(),
            SimulatedProcess {
                agent_id: request.agent_id.clone(),
                alive: true,
                exit_code: None,
                started: Instant::now(),
            },
        );

        let resume_token = request.resume_token.clone().or_else(|| {
            script
                .issue_tokens
                .then(|| format!("resume-{}", request.agent_id))
        });
        Ok(Launched {
            handle,
            resume_token,
        })
    }

    async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let mut script = self.script();
        Self::refresh(&mut script, handle);
        script
            .processes
            .get(&handle.id)
            .is_some_and(|process| process.alive)
    }

    async fn terminate(&self, handle: &ProcessHandle, force: bool) -> Result<(), LaunchError> {
        let mut script = self.script();
        let ignore_graceful = script.ignore_graceful;
        let Some(process) = script.processes.get_mut(&handle.id) else {
            return Err(LaunchError::Terminate {
                handle: handle.id.clone(),
                reason: "unknown process".to_string(),
            });
        };
        let agent_id = process.agent_id.clone();
        if force || !ignore_graceful {
            process.alive = false;
        }
        script.terminations.push((agent_id, force));
        Ok(())
    }

    async fn exit_status(&self, handle: &ProcessHandle) -> Option<i32> {
        let mut script = self.script();
        Self::refresh(&mut script, handle);
        script
            .processes
            .get(&handle.id)
            .and_then(|process| process.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(agent: &str) -> LaunchRequest {
        let agent_id = AgentId::from(agent);
        LaunchRequest {
            session_id: SessionId::from("sess_test"),
            role: agent_id.role().to_string(),
            agent_id,
            task: "work".to_string(),
            workspace: PathBuf::from("/tmp/unused"),
            env: BTreeMap::new(),
            resume_token: None,
        }
    }

    #[tokio::test]
    async fn scripted_process_lifecycle() {
        let launcher = ScriptedLauncher::new();
        let launched = launcher.launch(&request("engineer-1")).await.unwrap();
        assert!(launcher.is_alive(&launched.handle).await);

        launcher.exit(&AgentId::from("engineer-1"), 3);
        assert!(!launcher.is_alive(&launched.handle).await);
        assert_eq!(launcher.exit_status(&launched.handle).await, Some(3));
    }

    #[tokio::test]
    async fn scripted_graceful_termination_can_be_ignored() {
        let launcher = ScriptedLauncher::new();
        launcher.ignore_graceful_termination(true);
        let launched = launcher.launch(&request("qa-1")).await.unwrap();

        launcher.terminate(&launched.handle, false).await.unwrap();
        assert!(launcher.is_alive(&launched.handle).await);
        launcher.terminate(&launched.handle, true).await.unwrap();
        assert!(!launcher.is_alive(&launched.handle).await);
        assert_eq!(launcher.exit_status(&launched.handle).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_exit_completes_processes() {
        let launcher = ScriptedLauncher::with_auto_exit(Duration::from_secs(2));
        let launched = launcher.launch(&request("writer-1")).await.unwrap();
        assert!(launcher.is_alive(&launched.handle).await);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!launcher.is_alive(&launched.handle).await);
        assert_eq!(launcher.exit_status(&launched.handle).await, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_launcher_reports_exit_code() {
        let workspace = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new("sh", vec!["-c".into(), "exit 7".into()]);
        let mut req = request("engineer-1");
        req.workspace = workspace.path().join("engineer-1");

        let launched = launcher.launch(&req).await.unwrap();
        let mut alive = true;
        for _ in 0..100 {
            alive = launcher.is_alive(&launched.handle).await;
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive);
        assert_eq!(launcher.exit_status(&launched.handle).await, Some(7));
        assert!(req.workspace.join("agent.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_launcher_writes_both_streams_to_the_agent_log() {
        let workspace = tempfile::tempdir().unwrap();
        let launcher = CommandLauncher::new(
            "sh",
            vec!["-c".into(), "echo started; echo warning >&2".into()],
        );
        let mut req = request("writer-1");
        req.workspace = workspace.path().join("writer-1");

        let launched = launcher.launch(&req).await.unwrap();
        for _ in 0..100 {
            if !launcher.is_alive(&launched.handle).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(launcher.exit_status(&launched.handle).await, Some(0));

        let log = tokio::fs::read_to_string(req.workspace.join("agent.log"))
            .await
            .unwrap();
        assert!(log.contains("started"));
        assert!(log.contains("warning"));
    }
}
