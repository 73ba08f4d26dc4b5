//! ---
//! keel_section: "03-high-availability"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Node-state supervisor running master and read-only rebinds."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::Utc;
use keel_common::NodeState;
use keel_rebind::{RebindError, RebindManager, RebindOutcome};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::node::{can_transition, NodeTransition, TransitionReason};

#[derive(Debug, Error)]
pub enum HaError {
    #[error("node {node} cannot move from {from} to {to}")]
    InvalidTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },
    #[error(transparent)]
    Rebind(#[from] RebindError),
}

#[derive(Debug)]
struct SupervisorInner {
    state: NodeState,
    history: Vec<NodeTransition>,
    refresh_failures: u32,
    last_outcome: Option<RebindOutcome>,
}

/// Owns the node state of one management node and drives its rebinds.
#[derive(Debug)]
pub struct HaSupervisor {
    node_id: String,
    manager: Arc<RebindManager>,
    inner: Mutex<SupervisorInner>,
    /// Held for the whole of a state-changing rebind or a refresh.
    runs: Mutex<()>,
}

impl HaSupervisor {
    pub fn new(node_id: impl Into<String>, manager: Arc<RebindManager>) -> Self {
        Self {
            node_id: node_id.into(),
            manager,
            inner: Mutex::new(SupervisorInner {
                state: NodeState::Initializing,
                history: Vec::new(),
                refresh_failures: 0,
                last_outcome: None,
            }),
            runs: Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn manager(&self) -> &Arc<RebindManager> {
        &self.manager
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    pub fn history(&self) -> Vec<NodeTransition> {
        self.inner.lock().history.clone()
    }

    pub fn refresh_failures(&self) -> u32 {
        self.inner.lock().refresh_failures
    }

    pub fn last_outcome(&self) -> Option<RebindOutcome> {
        self.inner.lock().last_outcome.clone()
    }

    /// Load a read-only copy of the graph and become a hot proxy.
    /// A failed load leaves the node `Failed`.
    pub fn activate_hot_proxy(&self, target: NodeState) -> Result<RebindOutcome, HaError> {
        let _run = self.runs.lock();
        let from = self.state();
        if !target.is_hot_proxy() || !can_transition(from, target) {
            return Err(self.invalid(from, target));
        }
        match self.manager.rebind(target) {
            Ok(outcome) => {
                let mut inner = self.inner.lock();
                self.transition_locked(&mut inner, target, TransitionReason::HotProxyActivated);
                inner.last_outcome = Some(outcome.clone());
                info!(node = %self.node_id, state = %target, applications = outcome.applications.len(), "hot proxy active");
                Ok(outcome)
            }
            Err(err) => {
                warn!(node = %self.node_id, state = %target, error = %err, "unable to activate hot proxy; switching to FAILED");
                self.fail();
                Err(err.into())
            }
        }
    }

    /// Become master and rebind with write ownership. On failure the node is
    /// demoted to `Failed` and the error returned.
    pub fn promote_to_master(&self) -> Result<RebindOutcome, HaError> {
        let _run = self.runs.lock();
        {
            let mut inner = self.inner.lock();
            let from = inner.state;
            if !can_transition(from, NodeState::Master) {
                return Err(self.invalid(from, NodeState::Master));
            }
            self.transition_locked(&mut inner, NodeState::Master, TransitionReason::Promoted);
        }
        info!(node = %self.node_id, "promoting to master");
        match self.manager.rebind(NodeState::Master) {
            Ok(outcome) => {
                self.inner.lock().last_outcome = Some(outcome.clone());
                info!(node = %self.node_id, applications = outcome.applications.len(), "master rebind complete");
                Ok(outcome)
            }
            Err(err) => {
                error!(node = %self.node_id, error = %err, "problem during rebind when promoting to master; demoting to FAILED");
                self.fail();
                Err(err.into())
            }
        }
    }

    /// Re-run the read-only rebind of a hot proxy. `None` when the node is not
    /// a hot proxy. Failures are counted and the node keeps its state.
    pub fn refresh(&self) -> Result<Option<RebindOutcome>, HaError> {
        let _run = self.runs.lock();
        let state = self.state();
        if !state.is_hot_proxy() {
            debug!(node = %self.node_id, state = %state, "not a hot proxy; skipping refresh");
            return Ok(None);
        }
        match self.manager.rebind(state) {
            Ok(outcome) => {
                self.inner.lock().last_outcome = Some(outcome.clone());
                Ok(Some(outcome))
            }
            Err(err) => {
                self.inner.lock().refresh_failures += 1;
                if let Some(metrics) = self.manager.metrics() {
                    metrics.note_error(err.to_string());
                }
                warn!(node = %self.node_id, state = %state, error = %err, "hot proxy refresh failed");
                Err(err.into())
            }
        }
    }

    /// Step down to `Standby` or `Failed`.
    pub fn demote_to(&self, target: NodeState) -> Result<(), HaError> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if !matches!(target, NodeState::Standby | NodeState::Failed) || !can_transition(from, target) {
            return Err(self.invalid(from, target));
        }
        self.transition_locked(&mut inner, target, TransitionReason::Demoted);
        Ok(())
    }

    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        if can_transition(inner.state, NodeState::Terminated) {
            self.transition_locked(&mut inner, NodeState::Terminated, TransitionReason::Terminated);
        }
    }

    fn fail(&self) {
        let mut inner = self.inner.lock();
        if can_transition(inner.state, NodeState::Failed) {
            self.transition_locked(&mut inner, NodeState::Failed, TransitionReason::RebindFailed);
        }
    }

    fn transition_locked(&self, inner: &mut SupervisorInner, to: NodeState, reason: TransitionReason) {
        let from = inner.state;
        inner.state = to;
        inner.history.push(NodeTransition {
            node_id: self.node_id.clone(),
            from,
            to,
            at: Utc::now(),
            reason,
        });
        debug!(node = %self.node_id, %from, %to, ?reason, "node state changed");
    }

    fn invalid(&self, from: NodeState, to: NodeState) -> HaError {
        HaError::InvalidTransition {
            node: self.node_id.clone(),
            from,
            to,
        }
    }
}
