//! Invocation lifecycle.

use std::fmt;

use tracing::{debug, error};

/// Stage of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Accepted, nothing checked yet.
    Created,
    /// Context, permissions, rate limit and input under check.
    Validating,
    /// Backup point taken.
    BackedUp,
    /// Transaction scope open.
    Transacting,
    /// Body running under the monitor.
    Monitoring,
    /// Result under verification.
    Verifying,
    /// Changes applied (or served from cache).
    Committed,
    /// Changes discarded.
    RolledBack,
    /// Outcome audited. Terminal.
    Logged,
}

impl InvocationState {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Created, Validating)
                | (Validating, BackedUp)
                | (Validating, Committed)
                | (Validating, RolledBack)
                | (BackedUp, Transacting)
                | (BackedUp, RolledBack)
                | (Transacting, Monitoring)
                | (Transacting, RolledBack)
                | (Monitoring, Verifying)
                | (Monitoring, RolledBack)
                | (Verifying, Committed)
                | (Verifying, RolledBack)
                | (Committed, Logged)
                | (RolledBack, Logged)
        )
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        self == InvocationState::Logged
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the states one invocation passes through.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: InvocationState,
    history: Vec<InvocationState>,
}

impl Lifecycle {
    /// Start in [`InvocationState::Created`].
    pub fn new() -> Self {
        Self {
            state: InvocationState::Created,
            history: vec![InvocationState::Created],
        }
    }

    /// Current state.
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Every state entered, in order.
    pub fn history(&self) -> &[InvocationState] {
        &self.history
    }

    /// Move to `next`. An illegal transition is logged and ignored.
    pub fn advance(&mut self, next: InvocationState) -> bool {
        if !self.state.can_transition_to(next) {
            error!(from = %self.state, to = %next, "illegal invocation state transition");
            return false;
        }
        debug!(from = %self.state, to = %next, "invocation state");
        self.state = next;
        self.history.push(next);
        true
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::InvocationState::*;
    use super::*;

    #[test]
    fn test_success_path() {
        let mut lc = Lifecycle::new();
        for next in [Validating, BackedUp, Transacting, Monitoring, Verifying, Committed, Logged] {
            assert!(lc.advance(next));
        }
        assert!(lc.state().is_terminal());
        assert_eq!(lc.history().len(), 8);
    }

    #[test]
    fn test_precheck_failure_path() {
        let mut lc = Lifecycle::new();
        assert!(lc.advance(Validating));
        assert!(lc.advance(RolledBack));
        assert!(lc.advance(Logged));
        assert_eq!(lc.history(), &[Created, Validating, RolledBack, Logged]);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut lc = Lifecycle::new();
        assert!(!lc.advance(Committed));
        assert_eq!(lc.state(), Created);

        lc.advance(Validating);
        lc.advance(RolledBack);
        lc.advance(Logged);
        assert!(!lc.advance(Validating));
        assert!(!Logged.can_transition_to(RolledBack));
    }
}
