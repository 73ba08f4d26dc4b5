//! ---
//! keel_section: "01-core-functionality"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Shared primitives and utilities for the rebind runtime."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Core shared primitives for the keel workspace.
//! This crate exposes configuration loading, the node-state and failure-mode
//! vocabulary shared by the rebind engine and the HA supervisor, and tracing
//! initialisation.

pub mod config;
pub mod logging;
pub mod quorum;

pub use config::{
    AppConfig, FailureMode, FailureModes, LoggingConfig, NodeState, RebindConfig, SnapshotConfig,
    SnapshotFormat,
};
pub use logging::{init_tracing, LogFormat};
pub use quorum::QuorumCheck;
