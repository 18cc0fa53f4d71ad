//! Node lifecycle state.

/// Node operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Backends connected, loops not yet running.
    Starting,
    /// Background loops running.
    Running,
    /// Shutdown requested, draining background loops.
    ShuttingDown,
    /// Node is stopped.
    Stopped,
}

impl NodeState {
    /// Check if the node is operational.
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    /// Check if the node is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(NodeState::Running.is_operational());
        assert!(!NodeState::ShuttingDown.is_operational());
        assert!(NodeState::Stopped.is_terminal());
        assert!(!NodeState::Starting.is_terminal());
    }
}
