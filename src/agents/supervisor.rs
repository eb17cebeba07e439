//! Health supervision: one task per live agent, polling liveness on a fixed interval.
//!
//! Supervisors never touch session state. They report what they observe through a
//! channel drained by the orchestrator task.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::launcher::ProcessLauncher;
use crate::model::{AgentId, ProcessHandle, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Process ended and the launcher observed its exit code.
    Exited { code: i32 },
    /// Process is gone and no exit code is available.
    Vanished { uptime: Duration },
    /// Process outlived its role's runtime limit.
    TimedOut { after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorReport {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    /// Reports for a handle the agent no longer owns are stale and get dropped.
    pub handle: ProcessHandle,
    pub observation: Observation,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisionSettings {
    pub interval: Duration,
    pub jitter: Duration,
    pub timeout: Option<Duration>,
}

pub struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Supervisor {
    pub fn spawn(
        launcher: Arc<dyn ProcessLauncher>,
        session_id: SessionId,
        agent_id: AgentId,
        handle: ProcessHandle,
        settings: SupervisionSettings,
        reports: mpsc::UnboundedSender<SupervisorReport>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let jitter_ms = settings.jitter.as_millis() as u64;
        let offset = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut first = true;
            loop {
                let wait = if first {
                    settings.interval + offset
                } else {
                    settings.interval
                };
                first = false;

                tokio::select! {
                    () = stop.cancelled() => {
                        debug!(agent_id = %agent_id, "Supervisor stopped");
                        return;
                    }
                    () = tokio::time::sleep(wait) => {}
                }

                let observation = if let Some(limit) =
                    settings.timeout.filter(|limit| started.elapsed() >= *limit)
                {
                    Some(Observation::TimedOut { after: limit })
                } else if !launcher.is_alive(&handle).await {
                    Some(match launcher.exit_status(&handle).await {
                        Some(code) => Observation::Exited { code },
                        None => Observation::Vanished {
                            uptime: started.elapsed(),
                        },
                    })
                } else {
                    None
                };

                if let Some(observation) = observation {
                    let report = SupervisorReport {
                        session_id: session_id.clone(),
                        agent_id: agent_id.clone(),
                        handle: handle.clone(),
                        observation,
                    };
                    if reports.send(report).is_err() {
                        warn!(agent_id = %agent_id, "Orchestrator gone, dropping supervisor report");
                    }
                    return;
                }
            }
        });

        Self { cancel, task }
    }

    pub fn stop(self) {
        self.cancel.cancel();
        drop(self.task);
    }
}
