//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Eight-phase sequencer driving one rebind run."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Rebind iteration.
//!
//! One [`RebindIteration`] owns the context and exception handler of a single
//! run and walks it through eight phases in strict order:
//!
//! 1. load manifests
//! 2. rebuild the catalog
//! 3. instantiate locations and entities
//! 4. load full mementos
//! 5. instantiate adjuncts
//! 6. reconstruct locations, adjuncts, then entities
//! 7. associate adjuncts with their entities
//! 8. hand roots to the management plane
//!
//! Phases can be driven one at a time or all at once with [`RebindIteration::run`].
//! Entering a phase out of order is a [`RebindError::PhaseOrderViolation`];
//! driving an iteration after a phase has aborted is [`RebindError::IterationReused`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_common::{NodeState, RebindConfig};
use keel_logging::{keel_debug, keel_rebinding, keel_warn, LogContext};
use keel_persistence::{MementoRawData, ObjectKind};

use crate::catalog::{CatalogInitialization, CatalogPlan};
use crate::context::RebindContext;
use crate::error::{RebindError, Result, SupportError};
use crate::handler::{ActiveExceptionHandler, ExceptionHandler};
use crate::instantiator::{Creation, Instantiator};
use crate::management::{ManagementPlane, ManagementTransitionMode};
use crate::memento::{FullMemento, MementoManifest};
use crate::model::{Entity, Location};
use crate::registry::TypeRegistry;
use crate::sort::sort_parent_first;
use crate::store::{AdjunctKinds, MementoStore};
use crate::support::{
    AdjunctAttachment, AdjunctSupport, CatalogItemSupport, EntitySupport, LocationSupport, RebindSupport,
    SupportResult,
};

const PHASE_NAMES: [&str; 8] = [
    "load manifests",
    "rebuild catalog",
    "instantiate locations and entities",
    "load mementos",
    "instantiate adjuncts",
    "reconstruct",
    "associate adjuncts",
    "manage objects",
];

const ADJUNCT_KINDS: [ObjectKind; 3] = [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed];

/// Collaborators shared by every iteration a manager runs.
#[derive(Clone, Copy)]
pub struct RebindServices<'a> {
    pub types: &'a TypeRegistry,
    pub store: &'a dyn MementoStore,
    pub plane: &'a dyn ManagementPlane,
    pub catalog: &'a CatalogInitialization,
}

/// Objects per category registered by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub entities: usize,
    pub locations: usize,
    pub policies: usize,
    pub enrichers: usize,
    pub feeds: usize,
    pub catalog_items: usize,
}

impl ObjectCounts {
    fn from_context(ctx: &RebindContext) -> Self {
        Self {
            entities: ctx.count(ObjectKind::Entity),
            locations: ctx.count(ObjectKind::Location),
            policies: ctx.count(ObjectKind::Policy),
            enrichers: ctx.count(ObjectKind::Enricher),
            feeds: ctx.count(ObjectKind::Feed),
            catalog_items: ctx.count(ObjectKind::CatalogItem),
        }
    }

    pub fn total(&self) -> usize {
        self.entities + self.locations + self.policies + self.enrichers + self.feeds + self.catalog_items
    }
}

impl fmt::Display for ObjectCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entities, {} locations, {} policies, {} enrichers, {} feeds, {} catalog items",
            self.entities, self.locations, self.policies, self.enrichers, self.feeds, self.catalog_items
        )
    }
}

/// Result of a run the exception handler let through.
#[derive(Debug, Clone)]
pub struct RebindOutcome {
    pub node_state: NodeState,
    pub read_only: bool,
    /// Top-level applications handed to the management plane.
    pub applications: Vec<Arc<Entity>>,
    pub counts: ObjectCounts,
    /// Previously managed entities absent from this run. Never destroyed here.
    pub stale_entities: Vec<String>,
    pub stale_locations: Vec<String>,
    /// Persisted catalog items discarded by a reset.
    pub catalog_items_removed: Vec<String>,
    pub warnings: usize,
    pub dangling: usize,
    pub completed_at: DateTime<Utc>,
}

impl RebindOutcome {
    pub fn application_ids(&self) -> Vec<String> {
        self.applications.iter().map(|app| app.id().to_owned()).collect()
    }

    pub fn application(&self, id: &str) -> Option<&Arc<Entity>> {
        self.applications.iter().find(|app| app.id() == id)
    }
}

/// One rebind run.
pub struct RebindIteration<'a> {
    node_state: NodeState,
    config: &'a RebindConfig,
    services: RebindServices<'a>,
    raw: &'a MementoRawData,
    ctx: RebindContext,
    handler: ActiveExceptionHandler,
    phase: u8,
    failed: bool,
    run_id: String,
    iteration: u64,
    loud: bool,
    manifest: MementoManifest,
    memento: FullMemento,
    catalog_plan: CatalogPlan,
    catalog_items_removed: Vec<String>,
    stale_entities: Vec<String>,
    stale_locations: Vec<String>,
    applications: Vec<Arc<Entity>>,
}

impl<'a> RebindIteration<'a> {
    /// Prepare a run over `raw`. Fails for node states that cannot be rebound.
    pub fn new(
        node_state: NodeState,
        config: &'a RebindConfig,
        services: RebindServices<'a>,
        handler: ExceptionHandler,
        raw: &'a MementoRawData,
    ) -> Result<Self> {
        let ctx = RebindContext::new(node_state)?;
        Ok(Self {
            node_state,
            config,
            services,
            raw,
            ctx,
            handler: handler.start(),
            phase: 0,
            failed: false,
            run_id: "rebind".to_owned(),
            iteration: 0,
            loud: true,
            manifest: MementoManifest::default(),
            memento: FullMemento::default(),
            catalog_plan: CatalogPlan::default(),
            catalog_items_removed: Vec::new(),
            stale_entities: Vec::new(),
            stale_locations: Vec::new(),
            applications: Vec::new(),
        })
    }

    /// Label log events with a run id and read-only iteration count.
    pub fn with_logging(mut self, run_id: impl Into<String>, iteration: u64, loud: bool) -> Self {
        self.run_id = run_id.into();
        self.iteration = iteration;
        self.loud = loud;
        self
    }

    /// Last phase completed, 0 before the first.
    pub fn phase(&self) -> u8 {
        self.phase
    }

    pub fn context(&self) -> &RebindContext {
        &self.ctx
    }

    pub fn handler(&self) -> &ActiveExceptionHandler {
        &self.handler
    }

    /// Drive every phase, then finish or fold the failure.
    pub fn run(mut self) -> Result<RebindOutcome> {
        match self.run_phases() {
            Ok(()) => self.finish(),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn run_phases(&mut self) -> Result<()> {
        self.load_manifests()?;
        self.rebuild_catalog()?;
        self.instantiate_locations_and_entities()?;
        self.load_mementos()?;
        self.instantiate_adjuncts()?;
        self.reconstruct_everything()?;
        self.associate_adjuncts()?;
        self.manage_objects()
    }

    /// Phase 1.
    pub fn load_manifests(&mut self) -> Result<()> {
        self.step(1, |this| {
            this.manifest = this.services.store.load_manifest(this.raw, &mut this.handler)?;
            Ok(())
        })
    }

    /// Phase 2.
    pub fn rebuild_catalog(&mut self) -> Result<()> {
        self.step(2, Self::rebuild_catalog_phase)
    }

    /// Phase 3.
    pub fn instantiate_locations_and_entities(&mut self) -> Result<()> {
        self.step(3, Self::instantiate_phase)
    }

    /// Phase 4.
    pub fn load_mementos(&mut self) -> Result<()> {
        self.step(4, |this| {
            this.memento = this
                .services
                .store
                .load_memento(
                    this.raw,
                    &this.ctx,
                    AdjunctKinds::from_config(this.config),
                    &mut this.handler,
                )?;
            Ok(())
        })
    }

    /// Phase 5.
    pub fn instantiate_adjuncts(&mut self) -> Result<()> {
        self.step(5, Self::instantiate_adjuncts_phase)
    }

    /// Phase 6.
    pub fn reconstruct_everything(&mut self) -> Result<()> {
        self.step(6, Self::reconstruct_phase)
    }

    /// Phase 7.
    pub fn associate_adjuncts(&mut self) -> Result<()> {
        self.step(7, Self::associate_phase)
    }

    /// Phase 8.
    pub fn manage_objects(&mut self) -> Result<()> {
        self.step(8, Self::manage_phase)
    }

    /// Close a run that completed phase 8.
    pub fn finish(self) -> Result<RebindOutcome> {
        if self.failed {
            return Err(self.handler.on_failed(RebindError::IterationReused));
        }
        if self.phase != 8 {
            return Err(RebindError::PhaseOrderViolation {
                expected: 8,
                actual: self.phase,
            });
        }
        let counts = ObjectCounts::from_context(&self.ctx);
        let report = self.handler.on_done(self.ctx.total_count())?;
        Ok(RebindOutcome {
            node_state: self.node_state,
            read_only: self.ctx.is_read_only(),
            applications: self.applications,
            counts,
            stale_entities: self.stale_entities,
            stale_locations: self.stale_locations,
            catalog_items_removed: self.catalog_items_removed,
            warnings: report.warnings,
            dangling: report.dangling,
            completed_at: Utc::now(),
        })
    }

    /// Close a run that aborted with `err`.
    pub fn fail(self, err: RebindError) -> RebindError {
        self.handler.on_failed(err)
    }

    fn log_context(&self, phase: u8) -> LogContext<'_> {
        LogContext::new()
            .with_run(&self.run_id)
            .with_mode(self.node_state.as_str())
            .with_iteration(self.iteration)
            .with_phase(phase)
    }

    fn step(&mut self, phase: u8, body: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        if self.failed {
            return Err(RebindError::IterationReused);
        }
        if self.phase + 1 != phase {
            return Err(RebindError::PhaseOrderViolation {
                expected: self.phase + 1,
                actual: phase,
            });
        }
        let name = PHASE_NAMES[usize::from(phase - 1)];
        keel_rebinding!(loud = self.loud, context = self.log_context(phase), "RebindManager {}", name);
        let outcome = if self.handler.is_interrupted() {
            Err(RebindError::Interrupted)
        } else {
            body(self)
        };
        match outcome {
            Ok(()) => {
                self.phase = phase;
                Ok(())
            }
            Err(err) => {
                self.failed = true;
                keel_debug!(context = self.log_context(phase), "rebind aborted during {}: {}", name, err);
                Err(err)
            }
        }
    }

    fn adjunct_kind_enabled(&self, kind: ObjectKind) -> bool {
        AdjunctKinds::from_config(self.config).enabled(kind)
    }

    fn rebuild_catalog_phase(&mut self) -> Result<()> {
        let plan = self.services.catalog.plan(
            self.manifest.catalog_items.is_empty(),
            self.ctx.is_read_only(),
            self.config.persist_catalog_items,
        );
        self.catalog_plan = plan;
        if !plan.is_active() {
            keel_rebinding!(loud = self.loud, context = self.log_context(2), "catalog persistence disabled; not rebuilding catalog");
            return Ok(());
        }
        if plan.reset {
            self.catalog_items_removed = self.manifest.catalog_items.keys().cloned().collect();
            keel_warn!(
                context = self.log_context(2),
                "resetting catalog on first run; discarding {} persisted items",
                self.catalog_items_removed.len()
            );
        }

        let instantiator = Instantiator::new(self.services.types, self.config);
        let persisted = self
            .manifest
            .catalog_items
            .values()
            .filter(|_| plan.load_persisted);
        let initial = self
            .services
            .catalog
            .initial_items()
            .iter()
            .filter(|_| plan.load_initial);
        let additional = self
            .services
            .catalog
            .additional_items()
            .iter()
            .filter(|_| plan.load_additional);

        let mut created = Vec::new();
        for memento in persisted.chain(initial).chain(additional) {
            if self.ctx.contains(ObjectKind::CatalogItem, &memento.id) {
                continue;
            }
            let registered = instantiator
                .new_catalog_item(&self.ctx, memento)
                .and_then(|item| self.ctx.register_catalog_item(item.clone()).map(|_| item));
            match registered {
                Ok(item) => created.push((item, memento)),
                Err(err) => self.handler.on_create_failed(
                    ObjectKind::CatalogItem,
                    &memento.id,
                    &memento.symbolic_name,
                    err,
                )?,
            }
        }
        for (item, memento) in created {
            let result = CatalogItemSupport::new(item).reconstruct(&self.ctx, &mut self.handler, memento);
            settle(&mut self.handler, ObjectKind::CatalogItem, &memento.id, result)?;
        }
        keel_rebinding!(
            loud = self.loud,
            context = self.log_context(2),
            "rebuilt catalog with {} items",
            self.ctx.count(ObjectKind::CatalogItem)
        );
        Ok(())
    }

    fn instantiate_phase(&mut self) -> Result<()> {
        let instantiator = Instantiator::new(self.services.types, self.config);
        for manifest in self.manifest.locations.values() {
            self.ctx.declare_parent(&manifest.id, manifest.parent.as_deref());
            let created = instantiator
                .new_location(&self.ctx, &mut self.handler, manifest)
                .and_then(|location| Ok(self.ctx.register_location(location)?));
            settle_creation(&mut self.handler, ObjectKind::Location, &manifest.id, &manifest.type_name, created)?;
        }
        for manifest in self.manifest.entities.values() {
            self.ctx.declare_parent(&manifest.id, manifest.parent.as_deref());
            let catalog_item_id =
                instantiator.infer_entity_catalog_item_id(&self.ctx, &self.manifest.entities, manifest);
            let created = instantiator
                .new_entity(&self.ctx, &mut self.handler, manifest, catalog_item_id.as_deref())
                .and_then(|entity| Ok(self.ctx.register_entity(entity)?));
            settle_creation(&mut self.handler, ObjectKind::Entity, &manifest.id, &manifest.type_name, created)?;
        }
        keel_rebinding!(
            loud = self.loud,
            context = self.log_context(3),
            "instantiated {} locations and {} entities",
            self.ctx.count(ObjectKind::Location),
            self.ctx.count(ObjectKind::Entity)
        );
        Ok(())
    }

    fn instantiate_adjuncts_phase(&mut self) -> Result<()> {
        let instantiator = Instantiator::new(self.services.types, self.config);
        for kind in ADJUNCT_KINDS {
            if !self.adjunct_kind_enabled(kind) {
                keel_rebinding!(loud = self.loud, context = self.log_context(5), "{} persistence disabled; skipping", kind);
                continue;
            }
            let Some(mementos) = self.memento.adjuncts(kind) else {
                continue;
            };
            for memento in mementos.values() {
                let created = instantiator
                    .new_adjunct(&self.ctx, &mut self.handler, memento)
                    .and_then(|adjunct| Ok(self.ctx.register_adjunct(adjunct)?));
                settle_creation(&mut self.handler, kind, &memento.id, &memento.type_name, created)?;
            }
        }
        Ok(())
    }

    fn reconstruct_phase(&mut self) -> Result<()> {
        for memento in sort_parent_first(&self.memento.locations) {
            match self.ctx.location(&memento.id) {
                None => self.handler.on_not_found(ObjectKind::Location, &memento.id)?,
                Some(location) => {
                    let result = LocationSupport::new(location, self.services.types).reconstruct(
                        &self.ctx,
                        &mut self.handler,
                        memento,
                    );
                    settle(&mut self.handler, ObjectKind::Location, &memento.id, result)?;
                }
            }
        }

        for kind in ADJUNCT_KINDS {
            if !self.adjunct_kind_enabled(kind) {
                continue;
            }
            let Some(mementos) = self.memento.adjuncts(kind) else {
                continue;
            };
            for memento in mementos.values() {
                let Some(adjunct) = self.ctx.adjunct(kind, &memento.id) else {
                    self.handler.on_not_found(kind, &memento.id)?;
                    continue;
                };
                let result = AdjunctSupport::new(adjunct, self.services.types).reconstruct(
                    &self.ctx,
                    &mut self.handler,
                    memento,
                );
                match result {
                    Ok(()) => {}
                    Err(SupportError::Fatal(err)) => return Err(err),
                    Err(SupportError::Object(err)) => {
                        self.ctx.unregister_adjunct(kind, &memento.id);
                        self.handler.on_rebind_failed(kind, &memento.id, err)?;
                    }
                }
            }
        }

        for memento in sort_parent_first(&self.memento.entities) {
            match self.ctx.entity(&memento.id) {
                None => self.handler.on_not_found(ObjectKind::Entity, &memento.id)?,
                Some(entity) => {
                    let result = EntitySupport::new(entity, self.services.types).reconstruct(
                        &self.ctx,
                        &mut self.handler,
                        memento,
                    );
                    settle(&mut self.handler, ObjectKind::Entity, &memento.id, result)?;
                }
            }
        }
        Ok(())
    }

    fn associate_phase(&mut self) -> Result<()> {
        let policies = self.adjunct_kind_enabled(ObjectKind::Policy);
        let enrichers = self.adjunct_kind_enabled(ObjectKind::Enricher);
        let feeds = self.adjunct_kind_enabled(ObjectKind::Feed);
        for memento in self.memento.entities.values() {
            let Some(entity) = self.ctx.entity(&memento.id) else {
                continue;
            };
            let support = EntitySupport::new(entity, self.services.types);
            if policies {
                let result = support.add_policies(&self.ctx, &mut self.handler, memento);
                settle(&mut self.handler, ObjectKind::Entity, &memento.id, result)?;
            }
            if enrichers {
                let result = support.add_enrichers(&self.ctx, &mut self.handler, memento);
                settle(&mut self.handler, ObjectKind::Entity, &memento.id, result)?;
            }
            if feeds {
                let result = support.add_feeds(&self.ctx, &mut self.handler, memento);
                settle(&mut self.handler, ObjectKind::Entity, &memento.id, result)?;
            }
        }
        Ok(())
    }

    fn manage_phase(&mut self) -> Result<()> {
        let plane = self.services.plane;
        let read_only = self.ctx.is_read_only();

        self.stale_entities = plane
            .managed_ids(ObjectKind::Entity)
            .into_iter()
            .filter(|id| !self.ctx.contains(ObjectKind::Entity, id))
            .collect();
        self.stale_locations = plane
            .managed_ids(ObjectKind::Location)
            .into_iter()
            .filter(|id| !self.ctx.contains(ObjectKind::Location, id))
            .collect();

        let mut rebinding_again = 0usize;
        let modes = self
            .ctx
            .locations()
            .map(|location| (ObjectKind::Location, location.id().to_owned()))
            .chain(
                self.ctx
                    .entities()
                    .map(|entity| (ObjectKind::Entity, entity.id().to_owned())),
            );
        for (kind, id) in modes {
            let mode = ManagementTransitionMode::compute(plane.last_transition_mode(kind, &id), read_only);
            if mode.is_rebinding_active_again() {
                rebinding_again += 1;
            }
            plane.set_transition_mode(kind, &id, mode);
        }
        if rebinding_again > 0 {
            keel_debug!(
                context = self.log_context(8),
                "rebinding {} objects this node already manages",
                rebinding_again
            );
        }

        let roots: Vec<Arc<Location>> = self
            .ctx
            .locations()
            .filter(|location| location.parent().is_none())
            .cloned()
            .collect();
        for location in roots {
            if let Err(err) = plane.manage_rebinded_root_location(location.clone()) {
                self.handler
                    .on_manage_failed(ObjectKind::Location, location.id(), err)?;
            }
        }

        for id in &self.memento.application_ids {
            let Some(application) = self.ctx.entity(id) else {
                self.handler.on_not_found(ObjectKind::Entity, id)?;
                continue;
            };
            match plane.manage_rebinded_root_entity(application.clone()) {
                Ok(()) => self.applications.push(application),
                Err(err) => self.handler.on_manage_failed(ObjectKind::Entity, id, err)?,
            }
        }

        if self.catalog_plan.is_active() {
            if let Err(err) = plane.install_catalog(self.ctx.catalog_items_sorted()) {
                self.handler
                    .on_manage_failed(ObjectKind::CatalogItem, "catalog", err)?;
            }
        }

        if !self.stale_entities.is_empty() || !self.stale_locations.is_empty() {
            keel_debug!(
                context = self.log_context(8),
                "{} entities and {} locations no longer persisted; left for cleanup",
                self.stale_entities.len(),
                self.stale_locations.len()
            );
        }
        Ok(())
    }
}

impl fmt::Debug for RebindIteration<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebindIteration")
            .field("run_id", &self.run_id)
            .field("node_state", &self.node_state)
            .field("phase", &self.phase)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

/// Route a reconstruction step: fatal decisions propagate, object failures
/// go through the handler.
fn settle(
    handler: &mut ActiveExceptionHandler,
    kind: ObjectKind,
    id: &str,
    result: SupportResult,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(SupportError::Fatal(err)) => Err(err),
        Err(SupportError::Object(err)) => handler.on_rebind_failed(kind, id, err),
    }
}

/// Route an allocation: dangling-reference decisions propagate, anything
/// else is a creation failure of that object.
fn settle_creation(
    handler: &mut ActiveExceptionHandler,
    kind: ObjectKind,
    id: &str,
    type_name: &str,
    created: Creation<()>,
) -> Result<()> {
    match created {
        Ok(()) => Ok(()),
        Err(SupportError::Fatal(err)) => Err(err),
        Err(SupportError::Object(err)) => handler.on_create_failed(kind, id, type_name, err),
    }
}
