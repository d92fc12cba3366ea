//! Lifecycle states of the two takeover roles.

use std::fmt;

/// Outgoing daemon: the one handing its mounts away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Serving normally.
    Idle,
    /// A successor connected; waiting for its `Hello`.
    AwaitingSuccessor,
    /// Version and kinds being checked.
    Negotiating,
    /// Operations paused; entries being sent.
    Transferring,
    /// The successor confirmed; mounts belong to it now.
    Committed,
    /// The attempt failed and serving resumed.
    Aborted,
}

/// Incoming daemon: the successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    Idle,
    Connecting,
    Negotiating,
    Receiving,
    Activating,
    /// Mounts attached and operations resumed.
    Serving,
    /// The attempt failed; nothing was activated.
    Failed,
}

impl OutgoingState {
    /// Whether a new attempt may start from this state.
    pub fn accepts_attempt(self) -> bool {
        matches!(self, OutgoingState::Idle | OutgoingState::Aborted)
    }
}

impl fmt::Display for OutgoingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutgoingState::Idle => "idle",
            OutgoingState::AwaitingSuccessor => "awaiting-successor",
            OutgoingState::Negotiating => "negotiating",
            OutgoingState::Transferring => "transferring",
            OutgoingState::Committed => "committed",
            OutgoingState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

impl fmt::Display for IncomingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncomingState::Idle => "idle",
            IncomingState::Connecting => "connecting",
            IncomingState::Negotiating => "negotiating",
            IncomingState::Receiving => "receiving",
            IncomingState::Activating => "activating",
            IncomingState::Serving => "serving",
            IncomingState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_settled_states_accept_attempts() {
        assert!(OutgoingState::Idle.accepts_attempt());
        assert!(OutgoingState::Aborted.accepts_attempt());
        assert!(!OutgoingState::Transferring.accepts_attempt());
        assert!(!OutgoingState::Committed.accepts_attempt());
        assert_eq!(OutgoingState::AwaitingSuccessor.to_string(), "awaiting-successor");
    }
}
