//! Domain records shared by every component: sessions, agents, phases and plans.

pub mod agent;
pub mod ids;
pub mod phase;
pub mod plan;
pub mod session;

pub use agent::{
    Agent, AgentState, ExitSignal, ProcessHandle, CANCELLED_EXIT_CODE, CRASHED_EXIT_CODE,
    LAUNCH_FAILED_EXIT_CODE, LOST_EXIT_CODE, RESUME_FAILED_EXIT_CODE, TIMED_OUT_EXIT_CODE,
};
pub use ids::{is_valid_role_name, AgentId, PhaseId, SessionId};
pub use phase::{Phase, PhaseState};
pub use plan::{AgentSpec, PhaseSpec, PlanFile, SessionPlan};
pub use session::{ExecutionStrategy, Session, SessionState};
