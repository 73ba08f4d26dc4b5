//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Prometheus metrics for rebind runs."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::error::Result;

const RECENT_ERRORS: usize = 10;

/// Metrics published by the rebind manager.
#[derive(Clone)]
pub struct RebindMetrics {
    successes: IntCounterVec,
    failures: IntCounterVec,
    duration: HistogramVec,
    recent_errors: Arc<Mutex<VecDeque<String>>>,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl RebindMetrics {
    /// Register all rebind metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let successes = IntCounterVec::new(
            Opts::new(
                "keel_rebind_success_total",
                "Total number of rebind runs that completed",
            ),
            &["node_state"],
        )?;
        registry.register(Box::new(successes.clone()))?;

        let failures = IntCounterVec::new(
            Opts::new(
                "keel_rebind_failure_total",
                "Total number of rebind runs that raised a failure",
            ),
            &["node_state"],
        )?;
        registry.register(Box::new(failures.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "keel_rebind_duration_seconds",
            "Wall-clock duration of one rebind run",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 14)?);
        let duration = HistogramVec::new(histogram_opts, &["node_state"])?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            successes,
            failures,
            duration,
            recent_errors: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_ERRORS))),
            registry,
        })
    }

    pub fn note_success(&self, node_state: &str, seconds: f64) {
        self.successes.with_label_values(&[node_state]).inc();
        self.duration.with_label_values(&[node_state]).observe(seconds);
    }

    /// Record a failed run and remember its message.
    pub fn note_failure(&self, node_state: &str, seconds: f64, message: impl Into<String>) {
        self.failures.with_label_values(&[node_state]).inc();
        self.duration.with_label_values(&[node_state]).observe(seconds);
        self.note_error(message);
    }

    /// Remember an error without counting a failed run.
    pub fn note_error(&self, message: impl Into<String>) {
        let mut recent = self.recent_errors.lock();
        if recent.len() == RECENT_ERRORS {
            recent.pop_front();
        }
        recent.push_back(message.into());
    }

    /// Most recent error messages, oldest first.
    pub fn recent_errors(&self) -> Vec<String> {
        self.recent_errors.lock().iter().cloned().collect()
    }

    pub fn success_count(&self, node_state: &str) -> u64 {
        self.successes.with_label_values(&[node_state]).get()
    }

    pub fn failure_count(&self, node_state: &str) -> u64 {
        self.failures.with_label_values(&[node_state]).get()
    }
}

impl std::fmt::Debug for RebindMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebindMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_labelled_by_node_state() {
        let metrics = RebindMetrics::new(Arc::new(Registry::new())).unwrap();
        metrics.note_success("MASTER", 0.2);
        metrics.note_failure("HOT_STANDBY", 0.1, "quorum");
        assert_eq!(metrics.success_count("MASTER"), 1);
        assert_eq!(metrics.failure_count("HOT_STANDBY"), 1);
        assert_eq!(metrics.failure_count("MASTER"), 0);
        assert_eq!(metrics.recent_errors(), vec!["quorum"]);
    }

    #[test]
    fn recent_errors_are_bounded() {
        let metrics = RebindMetrics::new(Arc::new(Registry::new())).unwrap();
        for i in 0..25 {
            metrics.note_error(format!("error {i}"));
        }
        let recent = metrics.recent_errors();
        assert_eq!(recent.len(), RECENT_ERRORS);
        assert_eq!(recent.first().map(String::as_str), Some("error 15"));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Arc::new(Registry::new());
        RebindMetrics::new(registry.clone()).unwrap();
        assert!(RebindMetrics::new(registry).is_err());
    }
}
