use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{AgentId, PhaseId};

/// Exit code reported for a process that disappeared without a completion report.
pub const CRASHED_EXIT_CODE: i32 = -1;
pub const LAUNCH_FAILED_EXIT_CODE: i32 = -2;
/// Process was gone after an orchestrator restart and could not be resumed.
pub const LOST_EXIT_CODE: i32 = -3;
pub const TIMED_OUT_EXIT_CODE: i32 = -4;
pub const RESUME_FAILED_EXIT_CODE: i32 = -5;
pub const CANCELLED_EXIT_CODE: i32 = -6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Pending,
    Running,
    Resumable,
    Completed,
    Failed,
    Cancelled,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Ordinary lifecycle edges. Phase restarts during recovery reset agents explicitly
    /// through [`Agent::reset`] and never go through this table.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Resumable)
                | (Self::Resumable, Self::Running)
                | (Self::Resumable, Self::Failed)
                | (Self::Resumable, Self::Pending)
                | (Self::Resumable, Self::Cancelled)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Resumable => "resumable",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How a finished agent ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitSignal {
    Exited { code: i32 },
    Crashed { uptime_secs: u64 },
    LaunchFailed { reason: String },
    Lost,
    TimedOut { after_secs: u64 },
    ResumeFailed { reason: String },
    Cancelled { forced: bool },
}

impl ExitSignal {
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            Self::Crashed { .. } => CRASHED_EXIT_CODE,
            Self::LaunchFailed { .. } => LAUNCH_FAILED_EXIT_CODE,
            Self::Lost => LOST_EXIT_CODE,
            Self::TimedOut { .. } => TIMED_OUT_EXIT_CODE,
            Self::ResumeFailed { .. } => RESUME_FAILED_EXIT_CODE,
            Self::Cancelled { .. } => CANCELLED_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

/// Opaque handle to a launched worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: String,
    pub pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(id: impl Into<String>, pid: Option<u32>) -> Self {
        Self { id: id.into(), pid }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {pid})", self.id),
            None => f.write_str(&self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub role: String,
    pub task: String,
    pub state: AgentState,
    pub dependencies: Vec<AgentId>,
    #[serde(default)]
    pub phase: Option<PhaseId>,
    pub memory_mb: u64,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub process: Option<ProcessHandle>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit: Option<ExitSignal>,
    #[serde(default)]
    pub resume_attempts: u32,
}

impl Agent {
    pub fn pending(
        id: AgentId,
        role: impl Into<String>,
        task: impl Into<String>,
        dependencies: Vec<AgentId>,
        phase: Option<PhaseId>,
        memory_mb: u64,
    ) -> Self {
        Self {
            id,
            role: role.into(),
            task: task.into(),
            state: AgentState::Pending,
            dependencies,
            phase,
            memory_mb,
            resume_token: None,
            process: None,
            started_at: None,
            completed_at: None,
            exit: None,
            resume_attempts: 0,
        }
    }

    /// Returns the agent to `Pending` for a fresh start, discarding the process handle,
    /// resumability token and exit signal.
    pub fn reset(&mut self) {
        self.state = AgentState::Pending;
        self.resume_token = None;
        self.process = None;
        self.started_at = None;
        self.completed_at = None;
        self.exit = None;
        self.resume_attempts = 0;
    }
}
