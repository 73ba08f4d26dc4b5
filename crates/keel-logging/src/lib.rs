//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Structured logging adapters and sinks."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Structured logging helpers shared by the rebind engine and its tooling.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Identifier of the rebind run emitting the event.
    pub run: Option<&'a str>,
    /// Target node state of the run (MASTER, HOT_STANDBY, ...).
    pub mode: Option<&'a str>,
    /// Read-only iteration count at the time of the event.
    pub iteration: Option<u64>,
    /// Phase number, 1 through 8.
    pub phase: Option<u8>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a run identifier.
    pub fn with_run(mut self, run: &'a str) -> Self {
        self.run = Some(run);
        self
    }

    /// Attach the node state descriptor.
    pub fn with_mode(mut self, mode: &'a str) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Attach a read-only iteration count.
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Attach the current phase.
    pub fn with_phase(mut self, phase: u8) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Decides whether a rebind iteration logs at full verbosity.
///
/// Hot-standby nodes rebind on a timer; only the first `burst` iterations and
/// then every `period`-th one are logged loudly, the rest drop a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebindLogThrottle {
    burst: u64,
    period: u64,
}

impl RebindLogThrottle {
    /// Build a throttle; a zero period is treated as one.
    pub fn new(burst: u64, period: u64) -> Self {
        Self {
            burst,
            period: period.max(1),
        }
    }

    /// Whether the iteration with the given read-only count should log loudly.
    pub fn should_log(&self, read_only_iterations: u64) -> bool {
        read_only_iterations < self.burst || read_only_iterations % self.period == 0
    }
}

impl Default for RebindLogThrottle {
    fn default() -> Self {
        Self::new(5, 1000)
    }
}
