//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Type resolution and bare allocation of live objects."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Object instantiator.
//!
//! Resolves the implementation type of a manifest or memento (catalog item
//! first, then the default scope, then a catalog scan) and allocates a bare
//! object carrying only its identity. Registration is left to the caller.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use keel_common::RebindConfig;
use keel_persistence::ObjectKind;
use tracing::{debug, warn};

use crate::context::RebindContext;
use crate::error::SupportError;
use crate::handler::ActiveExceptionHandler;
use crate::memento::{
    symbolic_name_of, AdjunctMemento, CatalogItemMemento, ObjectManifest, DEFAULT_CATALOG_VERSION,
};
use crate::model::{Adjunct, CatalogItem, CatalogItemState, Configurable, Entity, Location};
use crate::registry::{Construction, TypeRegistration, TypeRegistry, TypeScope};

/// Outcome of allocating one object.
pub type Creation<T> = std::result::Result<T, SupportError>;

/// Implementation type chosen for one object.
#[derive(Debug, Clone)]
pub struct ResolvedType {
    pub registration: Arc<TypeRegistration>,
    /// Catalog item the object is stamped with.
    pub catalog_item_id: Option<String>,
}

/// Allocates bare objects for a run.
#[derive(Debug, Clone, Copy)]
pub struct Instantiator<'a> {
    types: &'a TypeRegistry,
    auto_fix_catalog_refs: bool,
    infer_catalog_item: bool,
}

impl<'a> Instantiator<'a> {
    pub fn new(types: &'a TypeRegistry, config: &RebindConfig) -> Self {
        Self {
            types,
            auto_fix_catalog_refs: config.auto_fix_catalog_refs,
            infer_catalog_item: config.infer_catalog_item_on_rebind,
        }
    }

    /// Catalog item for an id, upgrading to the best version of the same
    /// symbolic name when the exact id is gone and auto-fix is enabled.
    ///
    /// A missing id is a dangling catalog item reference even when auto-fix
    /// finds a replacement.
    pub fn find_catalog_item(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        catalog_item_id: &str,
    ) -> crate::error::Result<Option<Arc<CatalogItem>>> {
        if let Some(item) = ctx.catalog_item(catalog_item_id) {
            return Ok(Some(item));
        }
        handler.on_dangling_reference(ObjectKind::CatalogItem, catalog_item_id)?;
        if !self.auto_fix_catalog_refs {
            return Ok(None);
        }
        let symbolic_name = symbolic_name_of(catalog_item_id);
        let upgraded = ctx
            .catalog_items_sorted()
            .into_iter()
            .filter(|item| item.symbolic_name() == symbolic_name)
            .max_by(|a, b| {
                (!a.is_disabled())
                    .cmp(&!b.is_disabled())
                    .then_with(|| compare_versions(&a.version(), &b.version()))
            });
        if let Some(item) = &upgraded {
            debug!(from = %catalog_item_id, to = %item.id(), "upgraded catalog item reference");
        }
        Ok(upgraded)
    }

    /// Catalog item id for an entity manifest.
    ///
    /// Own id first; then, when inference is enabled, ancestors' ids, a catalog
    /// item named after the type (self then ancestors), and finally a scan of
    /// every catalog item. `None` when the default scope can load the type.
    pub fn infer_entity_catalog_item_id(
        &self,
        ctx: &RebindContext,
        manifests: &IndexMap<String, ObjectManifest>,
        manifest: &ObjectManifest,
    ) -> Option<String> {
        if let Some(id) = &manifest.catalog_item_id {
            return Some(id.clone());
        }
        if !self.infer_catalog_item {
            return None;
        }
        let lineage = ancestry(manifests, manifest);

        if let Some(inherited) = lineage.iter().skip(1).find_map(|m| m.catalog_item_id.clone()) {
            debug!(inferring_for = %manifest.id, catalog_item = %inherited, "inherited catalog item from ancestor");
            return Some(inherited);
        }

        for candidate in &lineage {
            let by_name = format!("{}:{}", candidate.type_name, DEFAULT_CATALOG_VERSION);
            if let Some(item) = ctx.catalog_item(&by_name) {
                debug!(inferring_for = %manifest.id, catalog_item = %item.id(), "matched catalog item by type name");
                return Some(item.id().to_owned());
            }
        }

        if self.types.resolve(&TypeScope::Default, &manifest.type_name).is_some() {
            return None;
        }

        let found = self.scan_catalog(ctx, &manifest.type_name)?;
        warn!(
            inferring_for = %manifest.id,
            type_name = %manifest.type_name,
            catalog_item = %found.id(),
            "inferred catalog item by scanning every catalog item; first match wins"
        );
        Some(found.id().to_owned())
    }

    /// Resolve the implementation type of one object.
    ///
    /// `Fatal` errors are handler decisions about a dangling catalog item;
    /// `Object` errors mean the type could not be loaded.
    pub fn load_type(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        kind: ObjectKind,
        id: &str,
        type_name: &str,
        catalog_item_id: Option<&str>,
    ) -> Creation<ResolvedType> {
        if let Some(catalog_item_id) = catalog_item_id {
            match self.find_catalog_item(ctx, handler, catalog_item_id)? {
                Some(item) => {
                    if let Some(registration) = self.resolve_through(&item, type_name) {
                        return Ok(ResolvedType {
                            registration,
                            catalog_item_id: Some(item.id().to_owned()),
                        });
                    }
                    warn!(kind = %kind, id = %id, type_name = %type_name, catalog_item = %item.id(),
                        "unable to load type through catalog item; trying default scope");
                }
                None => {
                    warn!(kind = %kind, id = %id, catalog_item = %catalog_item_id,
                        "catalog item not found; trying default scope");
                }
            }
            return match self.types.resolve(&TypeScope::Default, type_name) {
                Some(registration) => Ok(ResolvedType {
                    registration,
                    catalog_item_id: Some(catalog_item_id.to_owned()),
                }),
                None => Err(anyhow!(
                    "unable to load {} {} of type {} from catalog item {} or default scope",
                    kind,
                    id,
                    type_name,
                    catalog_item_id
                )
                .into()),
            };
        }

        if let Some(registration) = self.types.resolve(&TypeScope::Default, type_name) {
            return Ok(ResolvedType {
                registration,
                catalog_item_id: None,
            });
        }

        if self.infer_catalog_item {
            if let Some(item) = self.scan_catalog(ctx, type_name) {
                if let Some(registration) = self.resolve_through(&item, type_name) {
                    warn!(kind = %kind, id = %id, type_name = %type_name, catalog_item = %item.id(),
                        "loaded type by scanning every catalog item; first match wins");
                    return Ok(ResolvedType {
                        registration,
                        catalog_item_id: Some(item.id().to_owned()),
                    });
                }
            }
        }

        Err(anyhow!("unable to load {} {} of type {}", kind, id, type_name).into())
    }

    pub fn new_entity(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        manifest: &ObjectManifest,
        catalog_item_id: Option<&str>,
    ) -> Creation<Arc<Entity>> {
        let resolved = self.load_type(
            ctx,
            handler,
            ObjectKind::Entity,
            &manifest.id,
            &manifest.type_name,
            catalog_item_id,
        )?;
        let registration = checked(&resolved, ObjectKind::Entity)?;
        let entity = Entity::new(
            manifest.id.clone(),
            registration,
            resolved.catalog_item_id,
            ctx.is_read_only(),
        );
        seed_legacy_flags(entity.as_ref())?;
        Ok(entity)
    }

    pub fn new_location(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        manifest: &ObjectManifest,
    ) -> Creation<Arc<Location>> {
        let resolved = self.load_type(
            ctx,
            handler,
            ObjectKind::Location,
            &manifest.id,
            &manifest.type_name,
            manifest.catalog_item_id.as_deref(),
        )?;
        let registration = checked(&resolved, ObjectKind::Location)?;
        let location = Location::new(
            manifest.id.clone(),
            registration,
            resolved.catalog_item_id,
            ctx.is_read_only(),
        );
        seed_legacy_flags(location.as_ref())?;
        Ok(location)
    }

    pub fn new_adjunct(
        &self,
        ctx: &RebindContext,
        handler: &mut ActiveExceptionHandler,
        memento: &AdjunctMemento,
    ) -> Creation<Arc<Adjunct>> {
        let resolved = self.load_type(
            ctx,
            handler,
            memento.kind,
            &memento.id,
            &memento.type_name,
            memento.catalog_item_id.as_deref(),
        )?;
        let registration = checked(&resolved, memento.kind)?;
        if memento.kind == ObjectKind::Feed {
            if let Construction::Legacy { .. } = registration.construction() {
                return Err(anyhow!(
                    "feed {} of type {} must support construction without initialization",
                    memento.id,
                    memento.type_name
                )
                .into());
            }
        }
        let adjunct = Adjunct::new(
            memento.kind,
            memento.id.clone(),
            registration,
            resolved.catalog_item_id,
            ctx.is_read_only(),
        );
        seed_legacy_flags(adjunct.as_ref())?;
        Ok(adjunct)
    }

    /// Catalog items need no type resolution; only their identity is checked.
    pub fn new_catalog_item(&self, ctx: &RebindContext, memento: &CatalogItemMemento) -> Result<Arc<CatalogItem>> {
        if memento.symbolic_name.trim().is_empty() {
            bail!("catalog item {} has no symbolic name", memento.id);
        }
        let item = CatalogItem::new(memento.id.clone(), ctx.is_read_only());
        *item.state.write() = CatalogItemState {
            symbolic_name: memento.symbolic_name.clone(),
            version: memento.version.clone(),
            ..CatalogItemState::default()
        };
        Ok(item)
    }

    fn resolve_through(&self, item: &CatalogItem, type_name: &str) -> Option<Arc<TypeRegistration>> {
        self.types
            .resolve_in_bundles(&item.libraries(), type_name)
            .or_else(|| {
                let plan_type = item.plan_type();
                if plan_type.is_empty() || plan_type == type_name {
                    self.types.resolve(&TypeScope::Default, type_name)
                } else {
                    None
                }
            })
    }

    /// First catalog item, in id order, whose bundles can load `type_name`.
    fn scan_catalog(&self, ctx: &RebindContext, type_name: &str) -> Option<Arc<CatalogItem>> {
        ctx.catalog_items_sorted()
            .into_iter()
            .find(|item| self.types.resolve_in_bundles(&item.libraries(), type_name).is_some())
    }
}

fn checked(resolved: &ResolvedType, kind: ObjectKind) -> Result<Arc<TypeRegistration>> {
    let registration = resolved.registration.clone();
    if registration.kind() != kind {
        bail!(
            "type {} is registered as a {}, not a {}",
            registration.type_name(),
            registration.kind(),
            kind
        );
    }
    Ok(registration)
}

/// Legacy construction is deprecated: its flags only seed the config, which
/// the memento then overwrites.
fn seed_legacy_flags<T: Configurable>(object: &T) -> Result<()> {
    if let Construction::Legacy { flags } = object.registration().construction() {
        warn!(
            kind = %object.kind(),
            id = %object.id(),
            type_name = %object.registration().type_name(),
            "using deprecated legacy construction; register the type for construction without initialization"
        );
        let flags = flags.clone();
        object.with_common(|common| {
            for (key, value) in flags {
                common.config.insert(key, value);
            }
        });
    }
    Ok(())
}

/// `manifest` followed by its ancestors, stopping at missing parents or cycles.
fn ancestry<'m>(manifests: &'m IndexMap<String, ObjectManifest>, manifest: &'m ObjectManifest) -> Vec<&'m ObjectManifest> {
    let mut lineage = vec![manifest];
    let mut cursor = manifest.parent.as_deref();
    while let Some(parent_id) = cursor {
        match manifests.get(parent_id) {
            Some(parent) if !lineage.iter().any(|m| m.id == parent.id) => {
                lineage.push(parent);
                cursor = parent.parent.as_deref();
            }
            _ => break,
        }
    }
    lineage
}

/// Numeric-aware comparison of dotted versions.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-', '_']).map(str::to_owned).collect()
    };
    let (left, right) = (split(a), split(b));
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RebindError;
    use crate::handler::ExceptionHandler;
    use keel_common::{FailureMode, FailureModes, NodeState, QuorumCheck};

    fn handler() -> ActiveExceptionHandler {
        ExceptionHandler::new(FailureModes::default(), QuorumCheck::default()).start()
    }

    fn item(ctx: &mut RebindContext, symbolic: &str, version: &str, libraries: &[&str], plan: &str) {
        let memento = CatalogItemMemento::new(symbolic, version, plan);
        let item = CatalogItem::new(memento.id.clone(), false);
        *item.state.write() = CatalogItemState {
            symbolic_name: symbolic.into(),
            version: version.into(),
            plan_type: plan.into(),
            libraries: libraries.iter().map(|l| l.to_string()).collect(),
            ..CatalogItemState::default()
        };
        ctx.register_catalog_item(item).unwrap();
    }

    fn manifest(id: &str, type_name: &str, parent: Option<&str>, catalog: Option<&str>) -> ObjectManifest {
        ObjectManifest {
            id: id.into(),
            type_name: type_name.into(),
            catalog_item_id: catalog.map(str::to_owned),
            parent: parent.map(str::to_owned),
        }
    }

    #[test]
    fn versions_compare_numerically() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
    }

    #[test]
    fn auto_fix_picks_highest_version_of_same_name() {
        let types = TypeRegistry::new();
        let mut ctx = RebindContext::new(NodeState::Master).unwrap();
        item(&mut ctx, "web", "1.0", &[], "Web");
        item(&mut ctx, "web", "1.2", &[], "Web");
        let config = RebindConfig::default();
        let instantiator = Instantiator::new(&types, &config);
        let mut h = handler();
        let found = instantiator
            .find_catalog_item(&ctx, &mut h, "web:0.9")
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), "web:1.2");
        assert_eq!(h.missing(ObjectKind::CatalogItem), vec!["web:0.9"]);

        let mut strict = RebindConfig::default();
        strict.auto_fix_catalog_refs = false;
        assert!(Instantiator::new(&types, &strict)
            .find_catalog_item(&ctx, &mut h, "web:0.9")
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_catalog_item_is_a_dangling_reference() {
        let types = TypeRegistry::new();
        types.register(TypeRegistration::entity("Plain"));
        let ctx = RebindContext::new(NodeState::Master).unwrap();
        let config = RebindConfig::default();
        let instantiator = Instantiator::new(&types, &config);
        let m = manifest("e", "Plain", None, Some("gone:1.0"));

        let mut h = handler();
        let entity = instantiator
            .new_entity(&ctx, &mut h, &m, m.catalog_item_id.as_deref())
            .unwrap();
        assert_eq!(entity.type_name(), "Plain");
        assert_eq!(h.dangling_count(), 1);

        let mut modes = FailureModes::default();
        modes.dangling_ref = FailureMode::FailFast;
        let mut h = ExceptionHandler::new(modes, QuorumCheck::default()).start();
        let err = instantiator
            .new_entity(&ctx, &mut h, &m, m.catalog_item_id.as_deref())
            .unwrap_err();
        assert!(matches!(
            err,
            SupportError::Fatal(RebindError::DanglingReference {
                kind: ObjectKind::CatalogItem,
                ..
            })
        ));
    }

    #[test]
    fn catalog_item_id_is_inherited_from_ancestors() {
        let types = TypeRegistry::new();
        let ctx = RebindContext::new(NodeState::Master).unwrap();
        let manifests: IndexMap<_, _> = [
            manifest("app", "App", None, Some("stack:1.0")),
            manifest("child", "Node", Some("app"), None),
        ]
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();
        let config = RebindConfig::default();
        let inferred = Instantiator::new(&types, &config)
            .infer_entity_catalog_item_id(&ctx, &manifests, &manifests["child"]);
        assert_eq!(inferred.as_deref(), Some("stack:1.0"));
    }

    #[test]
    fn scan_is_ordered_by_catalog_id() {
        let types = TypeRegistry::new();
        types.register_in(TypeScope::bundle("b1"), TypeRegistration::entity("Shared"));
        types.register_in(TypeScope::bundle("b2"), TypeRegistration::entity("Shared"));
        let mut ctx = RebindContext::new(NodeState::Master).unwrap();
        item(&mut ctx, "zeta", "1.0", &["b2"], "Other");
        item(&mut ctx, "alpha", "1.0", &["b1"], "Other");
        let manifests = IndexMap::new();
        let config = RebindConfig::default();
        let inferred = Instantiator::new(&types, &config).infer_entity_catalog_item_id(
            &ctx,
            &manifests,
            &manifest("e", "Shared", None, None),
        );
        assert_eq!(inferred.as_deref(), Some("alpha:1.0"));
    }

    #[test]
    fn default_scope_needs_no_catalog_item() {
        let types = TypeRegistry::new();
        types.register(TypeRegistration::entity("Plain"));
        let ctx = RebindContext::new(NodeState::Master).unwrap();
        let config = RebindConfig::default();
        let instantiator = Instantiator::new(&types, &config);
        let m = manifest("e", "Plain", None, None);
        assert!(instantiator
            .infer_entity_catalog_item_id(&ctx, &IndexMap::new(), &m)
            .is_none());
        let entity = instantiator.new_entity(&ctx, &mut handler(), &m, None).unwrap();
        assert_eq!(entity.type_name(), "Plain");
        assert!(entity.catalog_item_id().is_none());
    }

    #[test]
    fn kind_mismatch_is_a_creation_error() {
        let types = TypeRegistry::new();
        types.register(TypeRegistration::location("Plain"));
        let ctx = RebindContext::new(NodeState::Master).unwrap();
        let config = RebindConfig::default();
        let err = Instantiator::new(&types, &config)
            .new_entity(&ctx, &mut handler(), &manifest("e", "Plain", None, None), None)
            .unwrap_err();
        assert!(err.to_string().contains("registered as a Location"));
    }

    #[test]
    fn legacy_feeds_are_rejected() {
        let types = TypeRegistry::new();
        types.register(TypeRegistration::feed("OldFeed").legacy(IndexMap::new()));
        let ctx = RebindContext::new(NodeState::Master).unwrap();
        let config = RebindConfig::default();
        let memento = AdjunctMemento::new(ObjectKind::Feed, "f-1", "OldFeed");
        assert!(Instantiator::new(&types, &config)
            .new_adjunct(&ctx, &mut handler(), &memento)
            .is_err());
    }
}
