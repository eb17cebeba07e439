// Agent Conductor Library - multi-agent session orchestration
// This exposes the core components for testing and integration

pub mod agents;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod model;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use agents::{
    AgentLifecycleManager, CommandLauncher, LaunchError, ProcessLauncher, ResourceLimiter,
    ResourceLimits, ScriptedLauncher, ShutdownOutcome, ShutdownSummary,
};
pub use checkpoint::{
    Checkpoint, CheckpointReason, CheckpointStore, FileSystemStore, MemoryStore, RecoveryAction,
    RecoveryReport, SessionSnapshot, StoreError,
};
pub use config::{ConductorConfig, RoleProfile};
pub use errors::{OrchestrationError, Result};
pub use events::{EventKind, OrchestrationEvent};
pub use model::{
    Agent, AgentId, AgentSpec, AgentState, ExecutionStrategy, ExitSignal, Phase, PhaseId,
    PhaseState, Session, SessionId, SessionPlan, SessionState,
};
pub use session::{Orchestrator, OrchestratorSettings, RecoverySummary, ShutdownMode};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_orchestration_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
