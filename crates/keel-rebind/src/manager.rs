//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Rebind manager owning the run permit, collaborators, and metrics."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use keel_common::{NodeState, RebindConfig};
use keel_logging::{keel_debug, keel_info, keel_warn, LogContext, RebindLogThrottle};
use keel_persistence::{load_snapshot, MementoRawData};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::catalog::CatalogInitialization;
use crate::error::{RebindError, Result};
use crate::handler::{ExceptionHandler, RebindInterrupt};
use crate::iteration::{RebindIteration, RebindOutcome, RebindServices};
use crate::management::ManagementPlane;
use crate::metrics::RebindMetrics;
use crate::registry::TypeRegistry;
use crate::store::{JsonMementoStore, MementoStore};

/// Supplies the raw persisted data for a run.
pub trait MementoSource: Send + Sync {
    fn load(&self) -> Result<MementoRawData>;

    fn describe(&self) -> String;
}

/// Reads a snapshot file on every run.
#[derive(Debug, Clone)]
pub struct SnapshotFileSource {
    path: PathBuf,
}

impl SnapshotFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MementoSource for SnapshotFileSource {
    fn load(&self) -> Result<MementoRawData> {
        Ok(load_snapshot(&self.path)?)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Raw data held in memory; replaceable between runs.
#[derive(Debug, Default)]
pub struct InMemorySource {
    data: RwLock<MementoRawData>,
}

impl InMemorySource {
    pub fn new(data: MementoRawData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn replace(&self, data: MementoRawData) {
        *self.data.write() = data;
    }
}

impl MementoSource for InMemorySource {
    fn load(&self) -> Result<MementoRawData> {
        Ok(self.data.read().clone())
    }

    fn describe(&self) -> String {
        "in-memory".to_owned()
    }
}

/// Counting permit serializing rebind runs.
#[derive(Debug)]
pub struct RebindPermit {
    available: Mutex<usize>,
    released: Condvar,
}

/// Held for the duration of one run; returns its permit on drop.
#[must_use = "the permit is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct PermitGuard<'a> {
    permit: &'a RebindPermit,
}

impl RebindPermit {
    pub fn new(permits: usize) -> Self {
        Self {
            available: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    /// Block until a permit is free.
    pub fn acquire(&self) -> PermitGuard<'_> {
        let mut available = self.available.lock();
        while *available == 0 {
            self.released.wait(&mut available);
        }
        *available -= 1;
        PermitGuard { permit: self }
    }

    pub fn try_acquire(&self) -> Option<PermitGuard<'_>> {
        let mut available = self.available.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(PermitGuard { permit: self })
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }
}

impl Default for RebindPermit {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        *self.permit.available.lock() += 1;
        self.permit.released.notify_one();
    }
}

/// Runs rebind iterations against one management plane.
pub struct RebindManager {
    config: RebindConfig,
    types: Arc<TypeRegistry>,
    store: Arc<dyn MementoStore>,
    source: Arc<dyn MementoSource>,
    plane: Arc<dyn ManagementPlane>,
    catalog: CatalogInitialization,
    permit: RebindPermit,
    runs: AtomicU64,
    read_only_iterations: AtomicU64,
    throttle: RebindLogThrottle,
    interrupt: RebindInterrupt,
    metrics: Option<RebindMetrics>,
}

impl RebindManager {
    pub fn new(
        config: RebindConfig,
        types: Arc<TypeRegistry>,
        source: Arc<dyn MementoSource>,
        plane: Arc<dyn ManagementPlane>,
    ) -> Self {
        let throttle = RebindLogThrottle::new(config.log_burst, config.log_period);
        let catalog = CatalogInitialization::new(config.reset_catalog_on_first_run);
        Self {
            config,
            types,
            store: Arc::new(JsonMementoStore::new()),
            source,
            plane,
            catalog,
            permit: RebindPermit::default(),
            runs: AtomicU64::new(0),
            read_only_iterations: AtomicU64::new(0),
            throttle,
            interrupt: RebindInterrupt::new(),
            metrics: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MementoStore>) -> Self {
        self.store = store;
        self
    }

    /// Replace the catalog initialization policy, e.g. to bundle initial items.
    pub fn with_catalog(mut self, catalog: CatalogInitialization) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_metrics(mut self, metrics: RebindMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RebindConfig {
        &self.config
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn plane(&self) -> &Arc<dyn ManagementPlane> {
        &self.plane
    }

    pub fn catalog(&self) -> &CatalogInitialization {
        &self.catalog
    }

    pub fn permit(&self) -> &RebindPermit {
        &self.permit
    }

    pub fn metrics(&self) -> Option<&RebindMetrics> {
        self.metrics.as_ref()
    }

    /// Handle that interrupts the run in progress and every later run until cleared.
    pub fn interrupt(&self) -> RebindInterrupt {
        self.interrupt.clone()
    }

    /// Read-only runs started so far.
    pub fn read_only_iterations(&self) -> u64 {
        self.read_only_iterations.load(Ordering::Relaxed)
    }

    /// Rebind into the node state named by the configuration.
    pub fn rebind_configured(&self) -> Result<RebindOutcome> {
        self.rebind(self.config.node_state)
    }

    /// Run one rebind targeting `node_state`.
    pub fn rebind(&self, node_state: NodeState) -> Result<RebindOutcome> {
        if !node_state.can_rebind() {
            return Err(RebindError::InvalidNodeState(node_state));
        }
        let _permit = self.permit.acquire();

        let read_only = node_state.is_hot_proxy();
        let iteration = if read_only {
            self.read_only_iterations.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };
        let loud = !read_only || self.throttle.should_log(iteration);
        let run_id = format!("rebind-{}", self.runs.fetch_add(1, Ordering::Relaxed) + 1);
        let log = LogContext::new()
            .with_run(&run_id)
            .with_mode(node_state.as_str())
            .with_iteration(iteration);
        let started = Instant::now();

        if loud {
            keel_info!(context = log.clone(), "Rebinding from {}", self.source.describe());
        } else {
            keel_debug!(context = log.clone(), "Rebinding from {}", self.source.describe());
        }

        let result = self.run_iteration(node_state, &run_id, iteration, loud);
        let elapsed = started.elapsed();

        match &result {
            Ok(outcome) => {
                if !read_only {
                    self.catalog.mark_final_initialization();
                }
                if let Some(metrics) = &self.metrics {
                    metrics.note_success(node_state.as_str(), elapsed.as_secs_f64());
                }
                if loud {
                    keel_info!(
                        context = log,
                        "Rebind complete in {:?}: {} applications, {}; {} warnings",
                        elapsed,
                        outcome.applications.len(),
                        outcome.counts,
                        outcome.warnings
                    );
                } else {
                    keel_debug!(
                        context = log,
                        "Rebind complete in {:?}: {}",
                        elapsed,
                        outcome.counts
                    );
                }
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.note_failure(node_state.as_str(), elapsed.as_secs_f64(), err.to_string());
                }
                keel_warn!(context = log, "Rebind failed after {:?}: {}", elapsed, err);
            }
        }
        result
    }

    fn run_iteration(
        &self,
        node_state: NodeState,
        run_id: &str,
        iteration: u64,
        loud: bool,
    ) -> Result<RebindOutcome> {
        let raw = self.source.load()?;
        let services = RebindServices {
            types: self.types.as_ref(),
            store: self.store.as_ref(),
            plane: self.plane.as_ref(),
            catalog: &self.catalog,
        };
        let handler = ExceptionHandler::from_config(&self.config).with_interrupt(self.interrupt.clone());
        RebindIteration::new(node_state, &self.config, services, handler, &raw)?
            .with_logging(run_id, iteration, loud)
            .run()
    }
}

impl fmt::Debug for RebindManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebindManager")
            .field("types", &self.types.len())
            .field("source", &self.source.describe())
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .field("read_only_iterations", &self.read_only_iterations())
            .finish_non_exhaustive()
    }
}
