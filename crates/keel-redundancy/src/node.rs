//! ---
//! keel_section: "03-high-availability"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Node-state transition table and transition records."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use keel_common::NodeState;
use serde::Serialize;

/// Whether a node may move from `from` to `to`.
///
/// A terminated node never moves again. A master steps down through
/// `Standby` or `Failed` before it can become a hot proxy.
pub fn can_transition(from: NodeState, to: NodeState) -> bool {
    use NodeState::*;
    match (from, to) {
        (Terminated, _) => false,
        (_, Terminated) | (_, Failed) => from != to,
        (Master, Master) => false,
        (_, Master) => true,
        (Master, HotStandby | HotBackup) => false,
        (_, HotStandby | HotBackup) => from != to,
        (_, Standby) => from != Standby,
        (_, Initializing) => false,
    }
}

/// Why a node changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionReason {
    HotProxyActivated,
    Promoted,
    RebindFailed,
    Demoted,
    Terminated,
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTransition {
    pub node_id: String,
    pub from: NodeState,
    pub to: NodeState,
    pub at: DateTime<Utc>,
    pub reason: TransitionReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standby_nodes_can_promote_or_go_hot() {
        assert!(can_transition(NodeState::Initializing, NodeState::HotStandby));
        assert!(can_transition(NodeState::HotStandby, NodeState::Master));
        assert!(can_transition(NodeState::HotBackup, NodeState::HotStandby));
        assert!(can_transition(NodeState::Failed, NodeState::HotBackup));
    }

    #[test]
    fn master_and_terminated_are_constrained() {
        assert!(!can_transition(NodeState::Master, NodeState::Master));
        assert!(!can_transition(NodeState::Master, NodeState::HotStandby));
        assert!(can_transition(NodeState::Master, NodeState::Standby));
        assert!(can_transition(NodeState::Master, NodeState::Failed));
        assert!(!can_transition(NodeState::Terminated, NodeState::Master));
        assert!(!can_transition(NodeState::HotStandby, NodeState::Initializing));
    }
}
