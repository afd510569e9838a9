//! Lifecycle states of a served endpoint.

use std::fmt;

/// Lifecycle state of a [`Server`](crate::Server).
///
/// Transitions follow a fixed edge table; `Stopped` and `Error` are
/// terminal, so a new server instance is required to serve again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Constructed, not yet serving.
    Init,
    /// Serve loops spawned, no peer has connected yet.
    Starting,
    /// At least one peer connection has been accepted.
    Ready,
    /// Graceful shutdown in progress.
    Stopping,
    /// Shutdown complete.
    Stopped,
    /// A serve loop failed.
    Error,
}

impl State {
    /// Whether the state has no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Error)
    }

    /// Whether the state machine may move from `self` to `next`.
    pub(crate) fn can_transition(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Init, Starting)
                | (Starting, Ready)
                | (Starting, Error)
                | (Ready, Error)
                | (Starting, Stopping)
                | (Ready, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Init => "INIT",
            State::Starting => "STARTING",
            State::Ready => "READY",
            State::Stopping => "STOPPING",
            State::Stopped => "STOPPED",
            State::Error => "ERROR",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::State::*;

    #[test]
    fn edge_table() {
        assert!(Init.can_transition(Starting));
        assert!(Starting.can_transition(Ready));
        assert!(Starting.can_transition(Error));
        assert!(Starting.can_transition(Stopping));
        assert!(Ready.can_transition(Error));
        assert!(Ready.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));

        // No shortcuts or reversals.
        assert!(!Init.can_transition(Ready));
        assert!(!Ready.can_transition(Init));
        assert!(!Ready.can_transition(Starting));
        assert!(!Stopping.can_transition(Error));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [Stopped, Error] {
            assert!(from.is_terminal());
            for to in [Init, Starting, Ready, Stopping, Stopped, Error] {
                assert!(!from.can_transition(to), "{from} -> {to} must be invalid");
            }
        }
    }
}
