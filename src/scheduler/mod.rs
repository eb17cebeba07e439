//! Dependency scheduling: graph validation at registration time and the eligibility
//! rules of each execution strategy. Everything here is a pure function of session state.

pub mod eligibility;
pub mod graph;

pub use eligibility::ScheduleView;
pub use graph::{validate, Node};
