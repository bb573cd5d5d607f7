//! Supervisor state machine.
//!
//! ```text
//! starting ──bind ok──▶ running ──signal──▶ draining ──drained/grace──▶ stopped
//!     └──────────────bind failed──────────────────────────────────────────▲
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl SupervisorState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Starting, Running) | (Starting, Stopped) | (Running, Draining) | (Draining, Stopped)
        )
    }

    /// Move to `next`, logging the transition.
    ///
    /// Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: SupervisorState) {
        if self.can_transition_to(next) {
            tracing::info!(from = %self, to = %next, "Supervisor state change");
            *self = next;
        } else {
            tracing::warn!(from = %self, to = %next, "Ignoring illegal supervisor transition");
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
