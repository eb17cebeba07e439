//! Session State Machine and the orchestrator actor that drives it.

pub mod orchestrator;
pub mod runtime;
pub mod state_machine;

pub use orchestrator::{Orchestrator, OrchestratorSettings, RecoverySummary, ShutdownMode};
pub use runtime::SessionRuntime;
pub use state_machine::{SessionEvent, SessionStateMachine};
