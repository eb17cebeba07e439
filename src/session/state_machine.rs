// Session lifecycle state machine
//
// created -> running <-> paused, then completed / failed / cancelled.

use statig::blocking::StateMachine;
use statig::prelude::*;

use crate::model::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
}

#[derive(Debug, Default)]
pub struct SessionLifecycle;

#[state_machine(initial = "State::created()", state(derive(Debug, Clone, PartialEq, Eq)))]
impl SessionLifecycle {
    #[state]
    fn created(event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Start => Transition(State::running()),
            SessionEvent::Fail => Transition(State::failed()),
            SessionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn running(event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Pause => Transition(State::paused()),
            SessionEvent::Complete => Transition(State::completed()),
            SessionEvent::Fail => Transition(State::failed()),
            SessionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn paused(event: &SessionEvent) -> Outcome<State> {
        match event {
            SessionEvent::Resume => Transition(State::running()),
            SessionEvent::Fail => Transition(State::failed()),
            SessionEvent::Cancel => Transition(State::cancelled()),
            _ => Handled,
        }
    }

    #[state]
    fn completed(event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn failed(event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }

    #[state]
    fn cancelled(event: &SessionEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

/// Session lifecycle driven by [`SessionEvent`]s. Events that are not legal in the
/// current state leave it unchanged and are reported as rejected.
pub struct SessionStateMachine {
    machine: StateMachine<SessionLifecycle>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            machine: SessionLifecycle.state_machine(),
        }
    }

    /// Rebuilds the machine in `state` by replaying the events that lead there.
    pub fn restore(state: SessionState) -> Self {
        let path: &[SessionEvent] = match state {
            SessionState::Created => &[],
            SessionState::Running => &[SessionEvent::Start],
            SessionState::Paused => &[SessionEvent::Start, SessionEvent::Pause],
            SessionState::Completed => &[SessionEvent::Start, SessionEvent::Complete],
            SessionState::Failed => &[SessionEvent::Fail],
            SessionState::Cancelled => &[SessionEvent::Cancel],
        };
        let mut machine = Self::new();
        for event in path {
            machine.machine.handle(event);
        }
        machine
    }

    pub fn current(&self) -> SessionState {
        match self.machine.state() {
            State::Created { .. } => SessionState::Created,
            State::Running { .. } => SessionState::Running,
            State::Paused { .. } => SessionState::Paused,
            State::Completed { .. } => SessionState::Completed,
            State::Failed { .. } => SessionState::Failed,
            State::Cancelled { .. } => SessionState::Cancelled,
        }
    }

    /// Applies `event`, returning `(from, to)` when the state changed.
    pub fn apply(&mut self, event: SessionEvent) -> Option<(SessionState, SessionState)> {
        let from = self.current();
        self.machine.handle(&event);
        let to = self.current();
        (from != to).then_some((from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.current(), SessionState::Created);
        assert_eq!(
            sm.apply(SessionEvent::Start),
            Some((SessionState::Created, SessionState::Running))
        );
        assert!(sm.apply(SessionEvent::Pause).is_some());
        assert!(sm.apply(SessionEvent::Resume).is_some());
        assert_eq!(
            sm.apply(SessionEvent::Complete),
            Some((SessionState::Running, SessionState::Completed))
        );
    }

    #[test]
    fn paused_session_cannot_complete() {
        let mut sm = SessionStateMachine::restore(SessionState::Paused);
        assert_eq!(sm.apply(SessionEvent::Complete), None);
        assert_eq!(sm.current(), SessionState::Paused);
    }

    #[test]
    fn terminal_states_absorb_events() {
        for terminal in [
            SessionState::Completed,
            SessionState::Failed,
            SessionState::Cancelled,
        ] {
            let mut sm = SessionStateMachine::restore(terminal);
            assert_eq!(sm.current(), terminal);
            for event in [
                SessionEvent::Start,
                SessionEvent::Pause,
                SessionEvent::Resume,
                SessionEvent::Cancel,
            ] {
                assert_eq!(sm.apply(event), None);
            }
        }
    }

    #[test]
    fn cancel_is_allowed_from_every_live_state() {
        for live in [
            SessionState::Created,
            SessionState::Running,
            SessionState::Paused,
        ] {
            let mut sm = SessionStateMachine::restore(live);
            assert_eq!(
                sm.apply(SessionEvent::Cancel),
                Some((live, SessionState::Cancelled))
            );
        }
    }
}
