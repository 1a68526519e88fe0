/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    #[default]
    Idle,
    Started,
    Suspended,
    Cancelled,
    Finished,
    Failed,
}

impl RequestState {
    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Cancelled | RequestState::Finished | RequestState::Failed
        )
    }

    /// Registered with the manager and waiting on the network
    pub fn is_executing(self) -> bool {
        matches!(self, RequestState::Started | RequestState::Suspended)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Idle, Started) => true,
            (Started, Suspended) | (Suspended, Started) => true,
            (Started | Suspended, Finished | Failed) => true,
            (Idle | Started | Suspended, Cancelled) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RequestState::*;
    use super::*;

    #[test]
    fn test_terminal_states_are_sticky() {
        for terminal in [Cancelled, Finished, Failed] {
            assert!(terminal.is_terminal());
            for next in [Idle, Started, Suspended, Cancelled, Finished, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_cancel_reachable_from_any_live_state() {
        for state in [Idle, Started, Suspended] {
            assert!(state.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_outcome_requires_start() {
        assert!(!Idle.can_transition_to(Finished));
        assert!(!Idle.can_transition_to(Failed));
        assert!(Suspended.can_transition_to(Finished));
        assert!(!Idle.can_transition_to(Suspended));
    }
}
