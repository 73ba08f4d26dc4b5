//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Per-category reconstruction of live objects from mementos."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Rebind support.
//!
//! Every category implements [`RebindSupport`]; only entities own adjuncts,
//! so only [`EntitySupport`] implements [`AdjunctAttachment`].

use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use keel_persistence::ObjectKind;
use serde_json::Value;

use crate::context::RebindContext;
use crate::error::SupportError;
use crate::handler::ActiveExceptionHandler;
use crate::memento::{AdjunctMemento, CatalogItemMemento, EntityMemento, LocationMemento};
use crate::model::{Adjunct, CatalogItem, CatalogItemState, Configurable, Entity, Location};
use crate::registry::{TypeRegistration, TypeRegistry};
use crate::values::ValueType;

/// Result of one reconstruction step.
pub type SupportResult = std::result::Result<(), SupportError>;

/// Rehydrates one live object from its memento.
pub trait RebindSupport {
    type Memento;

    /// Applies generic fields, then config, then customs.
    fn reconstruct(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &Self::Memento,
    ) -> SupportResult;

    /// Applies config key by key; a bad key is reported on its own.
    fn add_config(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &Self::Memento,
    ) -> SupportResult;

    fn add_customs(
        &self,
        _ctx: &RebindContext,
        _handler: &mut ActiveExceptionHandler,
        _memento: &Self::Memento,
    ) -> SupportResult {
        Ok(())
    }
}

/// Attaches reconstructed adjuncts to their owner.
pub trait AdjunctAttachment: RebindSupport {
    fn add_policies(&self, ctx: &RebindContext, handler: &mut ActiveExceptionHandler, memento: &Self::Memento) -> SupportResult;
    fn add_enrichers(&self, ctx: &RebindContext, handler: &mut ActiveExceptionHandler, memento: &Self::Memento) -> SupportResult;
    /// Feeds are started after attachment unless the run is read-only.
    fn add_feeds(&self, ctx: &RebindContext, handler: &mut ActiveExceptionHandler, memento: &Self::Memento) -> SupportResult;
}

/// Declared type of a config key: registration, then recorded type, then `any`.
fn declared_type(
    registration: &TypeRegistration,
    recorded: &IndexMap<String, String>,
    types: &TypeRegistry,
    key: &str,
) -> anyhow::Result<ValueType> {
    let value_type = match registration.declared_type(key) {
        Some(declared) => declared.clone(),
        None => recorded
            .get(key)
            .and_then(|name| name.parse::<ValueType>().ok())
            .unwrap_or(ValueType::Any),
    };
    if let ValueType::Custom(name) = &value_type {
        if !types.knows_value_type(name) {
            return Err(anyhow!("unknown config type {}", name));
        }
    }
    Ok(value_type)
}

fn apply_config<T: Configurable>(
    object: &T,
    types: &TypeRegistry,
    handler: &mut ActiveExceptionHandler,
    config: &IndexMap<String, Value>,
    recorded: &IndexMap<String, String>,
) -> SupportResult {
    for (key, value) in config {
        let coerced = declared_type(object.registration(), recorded, types, key)
            .and_then(|value_type| value_type.coerce(value));
        match coerced {
            Ok(coerced) => object.with_common(|common| {
                common.config.insert(key.clone(), coerced);
            }),
            Err(err) => handler.on_add_config_failed(object.kind(), object.id(), key, err)?,
        }
    }
    Ok(())
}

fn apply_common<T: Configurable>(
    object: &T,
    display_name: &Option<String>,
    description: Option<&String>,
    tags: &[String],
) {
    object.with_common(|common| {
        common.display_name = display_name.clone();
        if let Some(description) = description {
            common.description = Some(description.clone());
        }
        common.tags = tags.to_vec();
    });
}

/// A listed child is attached only when its own manifest names `parent_id`.
fn owns_child(
    ctx: &RebindContext,
    handler: &mut ActiveExceptionHandler,
    kind: ObjectKind,
    parent_id: &str,
    child_id: &str,
) -> bool {
    match ctx.declared_parent(child_id) {
        Some(declared) if declared == parent_id => true,
        declared => {
            handler.warn(format!(
                "Rebind: {} {} lists child {} whose parent is {}; not attaching",
                kind,
                parent_id,
                child_id,
                declared.unwrap_or("unset")
            ));
            false
        }
    }
}

/// Rebind support for an entity.
pub struct EntitySupport<'a> {
    entity: Arc<Entity>,
    types: &'a TypeRegistry,
}

impl<'a> EntitySupport<'a> {
    pub fn new(entity: Arc<Entity>, types: &'a TypeRegistry) -> Self {
        Self { entity, types }
    }

    fn add_adjuncts(
        &self,
        kind: ObjectKind,
        ids: &[String],
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
    ) -> SupportResult {
        for id in ids {
            if handler.creation_failed(id) {
                continue;
            }
            let Some(adjunct) = ctx.lookup_adjunct(kind, id, handler)? else {
                continue;
            };
            if let Err(err) = self.attach(&adjunct, ctx.is_read_only()) {
                handler.on_add_adjunct_failed(kind, self.entity.id(), id, err)?;
            }
        }
        Ok(())
    }

    fn attach(&self, adjunct: &Arc<Adjunct>, read_only: bool) -> anyhow::Result<()> {
        adjunct
            .registration()
            .object_hooks()
            .on_attach(adjunct.id(), &self.entity)?;
        adjunct.set_entity(&self.entity);
        self.entity.attach_adjunct(adjunct.clone());
        if adjunct.kind() == ObjectKind::Feed && !read_only {
            adjunct.start()?;
        }
        Ok(())
    }
}

impl RebindSupport for EntitySupport<'_> {
    type Memento = EntityMemento;

    fn reconstruct(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &EntityMemento,
    ) -> SupportResult {
        apply_common(
            self.entity.as_ref(),
            &memento.display_name,
            memento.description.as_ref(),
            &memento.tags,
        );
        self.add_config(ctx, handler, memento)?;
        self.add_customs(ctx, handler, memento)?;
        self.entity
            .registration()
            .object_hooks()
            .rebind(self.entity.id())?;
        Ok(())
    }

    fn add_config(
        &self,
        _ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &EntityMemento,
    ) -> SupportResult {
        apply_config(
            self.entity.as_ref(),
            self.types,
            handler,
            &memento.config,
            &memento.config_types,
        )
    }

    /// Effectors, attributes, parent, children, members, and locations.
    fn add_customs(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &EntityMemento,
    ) -> SupportResult {
        {
            let mut state = self.entity.state.write();
            state.effectors = memento.effectors.clone();
            state.attributes = memento.attributes.clone();
        }

        if let Some(parent_id) = &memento.parent {
            if let Some(parent) = ctx.lookup_entity(parent_id, handler)? {
                self.entity.set_parent(&parent);
            }
        }
        for child_id in &memento.children {
            if let Some(child) = ctx.lookup_entity(child_id, handler)? {
                if owns_child(ctx, handler, ObjectKind::Entity, self.entity.id(), child_id) {
                    self.entity.add_child(child);
                }
            }
        }
        for member_id in &memento.members {
            if let Some(member) = ctx.lookup_entity(member_id, handler)? {
                let mut state = self.entity.state.write();
                if !state
                    .members
                    .iter()
                    .filter_map(|m| m.upgrade())
                    .any(|m| m.id() == member.id())
                {
                    state.members.push(Arc::downgrade(&member));
                }
            }
        }
        for location_id in &memento.locations {
            if let Some(location) = ctx.lookup_location(location_id, handler)? {
                let mut state = self.entity.state.write();
                if !state.locations.iter().any(|l| l.id() == location.id()) {
                    state.locations.push(location);
                }
            }
        }
        Ok(())
    }
}

impl AdjunctAttachment for EntitySupport<'_> {
    fn add_policies(&self, ctx: &RebindContext, handler: &mut ActiveExceptionHandler, memento: &EntityMemento) -> SupportResult {
        self.add_adjuncts(ObjectKind::Policy, &memento.policies, ctx, handler)
    }

    fn add_enrichers(&self, ctx: &RebindContext, handler: &mut ActiveExceptionHandler, memento: &EntityMemento) -> SupportResult {
        self.add_adjuncts(ObjectKind::Enricher, &memento.enrichers, ctx, handler)
    }

    fn add_feeds(&self, ctx: &RebindContext, handler: &mut ActiveExceptionHandler, memento: &EntityMemento) -> SupportResult {
        self.add_adjuncts(ObjectKind::Feed, &memento.feeds, ctx, handler)
    }
}

/// Rebind support for a location.
pub struct LocationSupport<'a> {
    location: Arc<Location>,
    types: &'a TypeRegistry,
}

impl<'a> LocationSupport<'a> {
    pub fn new(location: Arc<Location>, types: &'a TypeRegistry) -> Self {
        Self { location, types }
    }
}

impl RebindSupport for LocationSupport<'_> {
    type Memento = LocationMemento;

    fn reconstruct(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &LocationMemento,
    ) -> SupportResult {
        apply_common(self.location.as_ref(), &memento.display_name, None, &memento.tags);
        self.add_config(ctx, handler, memento)?;
        self.add_customs(ctx, handler, memento)?;
        self.location
            .registration()
            .object_hooks()
            .rebind(self.location.id())?;
        Ok(())
    }

    fn add_config(
        &self,
        _ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &LocationMemento,
    ) -> SupportResult {
        apply_config(
            self.location.as_ref(),
            self.types,
            handler,
            &memento.config,
            &memento.config_types,
        )
    }

    fn add_customs(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &LocationMemento,
    ) -> SupportResult {
        if let Some(parent_id) = &memento.parent {
            if let Some(parent) = ctx.lookup_location(parent_id, handler)? {
                self.location.set_parent(&parent);
            }
        }
        for child_id in &memento.children {
            if let Some(child) = ctx.lookup_location(child_id, handler)? {
                if owns_child(ctx, handler, ObjectKind::Location, self.location.id(), child_id) {
                    self.location.add_child(child);
                }
            }
        }
        Ok(())
    }
}

/// Rebind support for a policy, enricher, or feed.
pub struct AdjunctSupport<'a> {
    adjunct: Arc<Adjunct>,
    types: &'a TypeRegistry,
}

impl<'a> AdjunctSupport<'a> {
    pub fn new(adjunct: Arc<Adjunct>, types: &'a TypeRegistry) -> Self {
        Self { adjunct, types }
    }
}

impl RebindSupport for AdjunctSupport<'_> {
    type Memento = AdjunctMemento;

    fn reconstruct(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &AdjunctMemento,
    ) -> SupportResult {
        apply_common(self.adjunct.as_ref(), &memento.display_name, None, &memento.tags);
        self.adjunct.state.write().unique_tag = memento.unique_tag.clone();
        self.add_config(ctx, handler, memento)?;
        self.adjunct
            .registration()
            .object_hooks()
            .rebind(self.adjunct.id())?;
        Ok(())
    }

    fn add_config(
        &self,
        _ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &AdjunctMemento,
    ) -> SupportResult {
        apply_config(
            self.adjunct.as_ref(),
            self.types,
            handler,
            &memento.config,
            &memento.config_types,
        )
    }
}

/// Rebind support for a catalog item.
pub struct CatalogItemSupport {
    item: Arc<CatalogItem>,
}

impl CatalogItemSupport {
    pub fn new(item: Arc<CatalogItem>) -> Self {
        Self { item }
    }
}

impl RebindSupport for CatalogItemSupport {
    type Memento = CatalogItemMemento;

    fn reconstruct(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &CatalogItemMemento,
    ) -> SupportResult {
        *self.item.state.write() = CatalogItemState {
            symbolic_name: memento.symbolic_name.clone(),
            version: memento.version.clone(),
            item_type: memento.item_type,
            plan_type: memento.plan_type.clone(),
            libraries: memento.libraries.clone(),
            display_name: memento.display_name.clone(),
            description: memento.description.clone(),
            tags: memento.tags.clone(),
            deprecated: memento.deprecated,
            disabled: memento.disabled,
        };
        self.add_config(ctx, handler, memento)
    }

    /// Catalog items carry no config.
    fn add_config(
        &self,
        _ctx: &RebindContext,
        _handler: &mut ActiveExceptionHandler,
        _memento: &CatalogItemMemento,
    ) -> SupportResult {
        Ok(())
    }
}
