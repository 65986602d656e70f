//! Per-device session lifecycle.

use std::fmt;

use crate::error::{Error, Result};

/// Lifecycle state of a device session.
///
/// ```text
/// Idle -> Spawning -> AwaitingReady -> ConnectingChannels -> Streaming
///                                            ^                  |
///                                            +--- channel lost -+
/// Streaming -> Stalling -> Restarting -> (fresh session)
/// any -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Spawning,
    AwaitingReady,
    ConnectingChannels,
    Streaming,
    Stalling,
    Restarting,
    Terminated,
}

impl SessionState {
    /// Whether the state table allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Spawning)
            | (Spawning, AwaitingReady)
            | (AwaitingReady, ConnectingChannels)
            | (ConnectingChannels, Streaming)
            // Channel lost while streaming; reconnect against the same process.
            | (Streaming, ConnectingChannels)
            // A shared bridge respawns its process in place.
            | (Restarting, Spawning) => true,
            (AwaitingReady | ConnectingChannels | Streaming, Stalling) => true,
            // Process faults skip straight to a restart.
            (Spawning | AwaitingReady | ConnectingChannels | Streaming | Stalling, Restarting) => {
                true
            }
            _ => false,
        }
    }

    /// Return `next` if the move is allowed.
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Whether a process is expected to exist in this state.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            SessionState::AwaitingReady
                | SessionState::ConnectingChannels
                | SessionState::Streaming
                | SessionState::Stalling
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Spawning => "spawning",
            SessionState::AwaitingReady => "awaiting-ready",
            SessionState::ConnectingChannels => "connecting-channels",
            SessionState::Streaming => "streaming",
            SessionState::Stalling => "stalling",
            SessionState::Restarting => "restarting",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = Idle;
        for next in [Spawning, AwaitingReady, ConnectingChannels, Streaming] {
            s = s.transition(next).unwrap();
        }
        assert_eq!(s, Streaming);
    }

    #[test]
    fn stall_then_restart() {
        let s = Streaming.transition(Stalling).unwrap();
        assert_eq!(s.transition(Restarting).unwrap(), Restarting);
    }

    #[test]
    fn any_state_can_terminate() {
        for s in [
            Idle,
            Spawning,
            AwaitingReady,
            ConnectingChannels,
            Streaming,
            Stalling,
            Restarting,
        ] {
            assert!(s.can_transition_to(Terminated), "{s} -> terminated");
        }
    }

    #[test]
    fn terminated_is_final() {
        assert!(Terminated.is_terminal());
        assert!(matches!(
            Terminated.transition(Spawning),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn no_skipping_readiness() {
        assert!(!Spawning.can_transition_to(Streaming));
        assert!(!Idle.can_transition_to(ConnectingChannels));
        assert!(!Stalling.can_transition_to(Streaming));
    }

    #[test]
    fn display_is_kebab_case() {
        assert_eq!(ConnectingChannels.to_string(), "connecting-channels");
    }
}
