/// Session lifecycle state machine
///
/// ```text
/// Idle -> Ready -> Synchronized <-> Visible <-> Focused
///                       |
///                    Stopping -> Idle -> Exiting
/// ```
///
/// Transitions are re-evaluated in a loop until none fires, and each one
/// queues exactly one event, so a poller sees every intermediate state.

use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    Exiting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything the transitions look at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionInputs {
    pub exiting: bool,
    pub stopping: bool,
    pub frames_completed: u64,
    pub is_visible: bool,
    pub hmd_mounted: bool,
}

/// Queued state change
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionEvent {
    pub state: SessionState,
    /// Compositor clock, seconds
    pub time: f64,
}

pub struct SessionStateMachine {
    state: SessionState,
    events: VecDeque<SessionEvent>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn next(&self, inputs: &SessionInputs) -> Option<SessionState> {
        use SessionState::*;
        match self.state {
            Idle if inputs.exiting => Some(Exiting),
            Idle => Some(Ready),
            Ready if inputs.frames_completed > 0 => Some(Synchronized),
            Synchronized if inputs.stopping => Some(Stopping),
            Synchronized if inputs.is_visible => Some(Visible),
            Visible if inputs.stopping || !inputs.is_visible => Some(Synchronized),
            Visible if inputs.hmd_mounted => Some(Focused),
            Focused if inputs.stopping || !inputs.hmd_mounted || !inputs.is_visible => Some(Visible),
            Stopping if inputs.exiting => Some(Idle),
            _ => None,
        }
    }

    /// Run transitions until none fires; returns the number taken
    ///
    /// `force_event` queues the current state first (used once at creation).
    pub fn update(&mut self, inputs: &SessionInputs, time: f64, force_event: bool) -> usize {
        if force_event {
            self.events.push_back(SessionEvent { state: self.state, time });
        }
        let mut transitions = 0;
        while let Some(next) = self.next(inputs) {
            crate::bridge_debug!("xr_bridge::Session", "Session state {} -> {}", self.state, next);
            self.state = next;
            self.events.push_back(SessionEvent { state: next, time });
            transitions += 1;
        }
        transitions
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
#[path = "session_state_tests.rs"]
mod tests;
