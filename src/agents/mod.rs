// Agent lifecycle: admission, process launch, health supervision and termination

pub mod launcher;
pub mod lifecycle;
pub mod resource_limiter;
pub mod supervisor;

pub use launcher::{CommandLauncher, LaunchError, LaunchRequest, Launched, ProcessLauncher, ScriptedLauncher};
pub use lifecycle::{AgentLifecycleManager, LifecycleSettings, ShutdownOutcome, ShutdownSummary};
pub use resource_limiter::{AdmissionError, Reservation, ResourceLimiter, ResourceLimits, ResourceUsage};
pub use supervisor::{Observation, SupervisionSettings, Supervisor, SupervisorReport};
