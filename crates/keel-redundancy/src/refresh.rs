//! ---
//! keel_section: "03-high-availability"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Periodic read-only rebind of a hot-proxy node."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use keel_common::NodeState;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::supervisor::HaSupervisor;

/// Refresh the hot-proxy graph every `every` until `shutdown` fires or the
/// node terminates. Ticks while the node is not a hot proxy are skipped.
pub fn spawn_standby_refresh(
    supervisor: Arc<HaSupervisor>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let node = supervisor.node_id().to_owned();
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; activation already loaded the graph.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(%node, "standby refresh shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    let state = supervisor.state();
                    if state == NodeState::Terminated {
                        debug!(%node, "node terminated; stopping standby refresh");
                        break;
                    }
                    if !state.is_hot_proxy() {
                        trace!(%node, %state, "skipping standby refresh");
                        continue;
                    }
                    let worker = supervisor.clone();
                    match tokio::task::spawn_blocking(move || worker.refresh()).await {
                        Ok(Ok(Some(outcome))) => {
                            trace!(%node, counts = %outcome.counts, "standby refresh complete");
                        }
                        Ok(Ok(None)) => {}
                        Ok(Err(err)) => warn!(%node, error = %err, "standby refresh failed"),
                        Err(err) => warn!(%node, error = %err, "standby refresh task panicked"),
                    }
                }
            }
        }
    })
}

/// A running standby refresh task and its shutdown switch.
#[derive(Debug)]
pub struct StandbyRefresh {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl StandbyRefresh {
    pub fn spawn(supervisor: Arc<HaSupervisor>, every: Duration) -> Self {
        let (shutdown, receiver) = broadcast::channel(1);
        let task = spawn_standby_refresh(supervisor, every, receiver);
        Self { shutdown, task }
    }

    /// Refresh at the interval configured on the supervisor's rebind manager.
    pub fn spawn_configured(supervisor: Arc<HaSupervisor>) -> Self {
        let every = supervisor.manager().config().standby_refresh_interval;
        Self::spawn(supervisor, every)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal shutdown and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            warn!(error = %err, "standby refresh task ended abnormally");
        }
    }
}
