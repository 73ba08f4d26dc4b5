//! ---
//! keel_section: "03-high-availability"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Node-state supervisor and hot-standby refresh task."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! High-availability supervision for a management node.

mod node;
mod refresh;
mod supervisor;

pub use node::{can_transition, NodeTransition, TransitionReason};
pub use refresh::{spawn_standby_refresh, StandbyRefresh};
pub use supervisor::{HaError, HaSupervisor};
