//! The want status state machine (spec.md §3, §4.4: "Status machine").

use serde::{Deserialize, Serialize};

/// `idle -> reaching -> (prepare_agent <-> executing) -> reaching -> achieved
/// | failed`; `suspended` is a shadow state reachable from any non-terminal
/// state via explicit pause, returning to the prior state on resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WantStatus {
    Idle,
    Reaching,
    PrepareAgent,
    Executing,
    Suspended,
    Achieved,
    Failed,
}

impl WantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WantStatus::Achieved | WantStatus::Failed)
    }

    /// Terminal states are sticky: no transition is legal out of them.
    pub fn can_transition_to(self, next: WantStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        use WantStatus::*;
        match (self, next) {
            (_, Suspended) => true,
            (Idle, Reaching) => true,
            (Reaching, PrepareAgent) => true,
            (PrepareAgent, Executing) => true,
            (PrepareAgent, Failed) => true,
            (Executing, Reaching) => true,
            (Reaching, Achieved) => true,
            (Reaching, Failed) => true,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl Default for WantStatus {
    fn default() -> Self {
        WantStatus::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_sticky() {
        assert!(!WantStatus::Achieved.can_transition_to(WantStatus::Reaching));
        assert!(!WantStatus::Failed.can_transition_to(WantStatus::Idle));
    }

    #[test]
    fn suspend_reachable_from_any_nonterminal_state() {
        assert!(WantStatus::Executing.can_transition_to(WantStatus::Suspended));
        assert!(WantStatus::Idle.can_transition_to(WantStatus::Suspended));
    }

    #[test]
    fn normal_flow_is_legal() {
        assert!(WantStatus::Idle.can_transition_to(WantStatus::Reaching));
        assert!(WantStatus::Reaching.can_transition_to(WantStatus::PrepareAgent));
        assert!(WantStatus::PrepareAgent.can_transition_to(WantStatus::Executing));
        assert!(WantStatus::Executing.can_transition_to(WantStatus::Reaching));
        assert!(WantStatus::Reaching.can_transition_to(WantStatus::Achieved));
    }
}
