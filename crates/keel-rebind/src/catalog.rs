//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Catalog initialization policy applied when the catalog is rebuilt."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Catalog initialization.
//!
//! The first rebind a node performs decides whether the persisted catalog is
//! trusted, reset, or topped up with bundled items. Once a master run has
//! completed, later runs only rebuild what was persisted.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::memento::CatalogItemMemento;

/// What phase 2 does with the catalog in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatalogPlan {
    /// Rebuild the persisted catalog items.
    pub load_persisted: bool,
    /// Discard the persisted catalog items.
    pub reset: bool,
    /// Add the initial items.
    pub load_initial: bool,
    /// Add the additional items.
    pub load_additional: bool,
}

impl CatalogPlan {
    /// Whether the run touches the catalog at all.
    pub fn is_active(&self) -> bool {
        self.load_persisted || self.reset || self.load_initial || self.load_additional
    }
}

/// Node-lifetime memory of catalog initialization.
#[derive(Debug, Default)]
pub struct CatalogInitialization {
    initial_items: Vec<CatalogItemMemento>,
    additional_items: Vec<CatalogItemMemento>,
    reset_on_first_run: bool,
    has_run_final_initialization: AtomicBool,
}

impl CatalogInitialization {
    pub fn new(reset_on_first_run: bool) -> Self {
        Self {
            reset_on_first_run,
            ..Self::default()
        }
    }

    /// Items loaded when the persisted catalog is empty (or reset).
    pub fn with_initial_items(mut self, items: Vec<CatalogItemMemento>) -> Self {
        self.initial_items = items;
        self
    }

    /// Items added on top of whatever was persisted, on the first run only.
    pub fn with_additional_items(mut self, items: Vec<CatalogItemMemento>) -> Self {
        self.additional_items = items;
        self
    }

    pub fn initial_items(&self) -> &[CatalogItemMemento] {
        &self.initial_items
    }

    pub fn additional_items(&self) -> &[CatalogItemMemento] {
        &self.additional_items
    }

    pub fn has_run_final_initialization(&self) -> bool {
        self.has_run_final_initialization.load(Ordering::Acquire)
    }

    /// Called after a master run completes; later runs are no longer first runs.
    pub fn mark_final_initialization(&self) {
        if !self.has_run_final_initialization.swap(true, Ordering::AcqRel) {
            debug!("catalog final initialization complete");
        }
    }

    /// Decide what phase 2 does.
    pub fn plan(&self, persisted_is_empty: bool, read_only: bool, persistence_enabled: bool) -> CatalogPlan {
        if !persistence_enabled {
            return CatalogPlan::default();
        }
        let first_run = !self.has_run_final_initialization();
        if first_run && self.reset_on_first_run && !read_only {
            return CatalogPlan {
                load_persisted: false,
                reset: true,
                load_initial: true,
                load_additional: true,
            };
        }
        CatalogPlan {
            load_persisted: true,
            reset: false,
            load_initial: first_run && persisted_is_empty,
            load_additional: first_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_persistence_skips_the_catalog() {
        let init = CatalogInitialization::new(true);
        let plan = init.plan(false, false, false);
        assert!(!plan.is_active());
    }

    #[test]
    fn reset_only_on_first_master_run() {
        let init = CatalogInitialization::new(true);
        let plan = init.plan(false, false, true);
        assert!(plan.reset && !plan.load_persisted && plan.load_initial);

        let standby = init.plan(false, true, true);
        assert!(!standby.reset && standby.load_persisted);

        init.mark_final_initialization();
        let later = init.plan(false, false, true);
        assert_eq!(
            later,
            CatalogPlan {
                load_persisted: true,
                ..CatalogPlan::default()
            }
        );
    }

    #[test]
    fn initial_items_only_fill_an_empty_catalog() {
        let init = CatalogInitialization::new(false);
        assert!(init.plan(true, false, true).load_initial);
        let populated = init.plan(false, false, true);
        assert!(!populated.load_initial);
        assert!(populated.load_additional);
    }
}
