//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Per-run registry of instantiated objects."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use keel_common::NodeState;
use keel_persistence::ObjectKind;

use crate::error::{RebindError, Result};
use crate::handler::ActiveExceptionHandler;
use crate::model::{Adjunct, CatalogItem, Entity, Location};

/// Answers whether a referenced object will exist in the current run.
pub trait ReferenceLookup {
    fn resolves(&self, kind: ObjectKind, id: &str) -> bool;
}

/// Id to object tables for one rebind run.
///
/// Tables only grow while objects are instantiated; adjuncts are the only
/// objects ever evicted.
#[derive(Debug)]
pub struct RebindContext {
    read_only: bool,
    entities: IndexMap<String, Arc<Entity>>,
    locations: IndexMap<String, Arc<Location>>,
    policies: IndexMap<String, Arc<Adjunct>>,
    enrichers: IndexMap<String, Arc<Adjunct>>,
    feeds: IndexMap<String, Arc<Adjunct>>,
    catalog_items: IndexMap<String, Arc<CatalogItem>>,
    // entity and location ids to the parent their own manifest names
    declared_parents: IndexMap<String, String>,
}

impl RebindContext {
    /// Context for a run targeting `node_state`. Only MASTER and the hot proxy
    /// states can be rebound.
    pub fn new(node_state: NodeState) -> Result<Self> {
        let read_only = match node_state {
            NodeState::Master => false,
            NodeState::HotStandby | NodeState::HotBackup => true,
            other => return Err(RebindError::InvalidNodeState(other)),
        };
        Ok(Self {
            read_only,
            entities: IndexMap::new(),
            locations: IndexMap::new(),
            policies: IndexMap::new(),
            enrichers: IndexMap::new(),
            feeds: IndexMap::new(),
            catalog_items: IndexMap::new(),
            declared_parents: IndexMap::new(),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn contains(&self, kind: ObjectKind, id: &str) -> bool {
        match kind {
            ObjectKind::Entity => self.entities.contains_key(id),
            ObjectKind::Location => self.locations.contains_key(id),
            ObjectKind::Policy => self.policies.contains_key(id),
            ObjectKind::Enricher => self.enrichers.contains_key(id),
            ObjectKind::Feed => self.feeds.contains_key(id),
            ObjectKind::CatalogItem => self.catalog_items.contains_key(id),
        }
    }

    /// Category already holding `id`, if any.
    fn registered_kind(&self, id: &str) -> Option<ObjectKind> {
        ObjectKind::ALL.into_iter().find(|kind| self.contains(*kind, id))
    }

    fn ensure_unregistered(&self, kind: ObjectKind, id: &str) -> anyhow::Result<()> {
        match self.registered_kind(id) {
            Some(existing) => Err(anyhow!(
                "cannot register {} {}: id already registered as {}",
                kind,
                id,
                existing
            )),
            None => Ok(()),
        }
    }

    pub fn register_entity(&mut self, entity: Arc<Entity>) -> anyhow::Result<()> {
        self.ensure_unregistered(ObjectKind::Entity, entity.id())?;
        self.entities.insert(entity.id().to_owned(), entity);
        Ok(())
    }

    pub fn register_location(&mut self, location: Arc<Location>) -> anyhow::Result<()> {
        self.ensure_unregistered(ObjectKind::Location, location.id())?;
        self.locations.insert(location.id().to_owned(), location);
        Ok(())
    }

    pub fn register_adjunct(&mut self, adjunct: Arc<Adjunct>) -> anyhow::Result<()> {
        self.ensure_unregistered(adjunct.kind(), adjunct.id())?;
        let table = self.adjunct_table_mut(adjunct.kind())?;
        table.insert(adjunct.id().to_owned(), adjunct);
        Ok(())
    }

    pub fn register_catalog_item(&mut self, item: Arc<CatalogItem>) -> anyhow::Result<()> {
        self.ensure_unregistered(ObjectKind::CatalogItem, item.id())?;
        self.catalog_items.insert(item.id().to_owned(), item);
        Ok(())
    }

    /// Record the parent a persisted entity or location names for itself.
    pub fn declare_parent(&mut self, id: &str, parent: Option<&str>) {
        match parent {
            Some(parent) => {
                self.declared_parents.insert(id.to_owned(), parent.to_owned());
            }
            None => {
                self.declared_parents.shift_remove(id);
            }
        }
    }

    pub fn declared_parent(&self, id: &str) -> Option<&str> {
        self.declared_parents.get(id).map(String::as_str)
    }

    /// Evict an adjunct whose reconstruction failed.
    pub fn unregister_adjunct(&mut self, kind: ObjectKind, id: &str) -> Option<Arc<Adjunct>> {
        self.adjunct_table_mut(kind)
            .ok()
            .and_then(|table| table.shift_remove(id))
    }

    pub fn entity(&self, id: &str) -> Option<Arc<Entity>> {
        self.entities.get(id).cloned()
    }

    pub fn location(&self, id: &str) -> Option<Arc<Location>> {
        self.locations.get(id).cloned()
    }

    pub fn adjunct(&self, kind: ObjectKind, id: &str) -> Option<Arc<Adjunct>> {
        self.adjunct_table(kind).and_then(|table| table.get(id).cloned())
    }

    pub fn catalog_item(&self, id: &str) -> Option<Arc<CatalogItem>> {
        self.catalog_items.get(id).cloned()
    }

    /// Entity lookup that classifies a miss as a dangling reference.
    pub fn lookup_entity(
        &self,
        id: &str,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<Option<Arc<Entity>>> {
        match self.entity(id) {
            Some(found) => Ok(Some(found)),
            None => handler.on_dangling_reference(ObjectKind::Entity, id).map(|_| None),
        }
    }

    pub fn lookup_location(
        &self,
        id: &str,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<Option<Arc<Location>>> {
        match self.location(id) {
            Some(found) => Ok(Some(found)),
            None => handler.on_dangling_reference(ObjectKind::Location, id).map(|_| None),
        }
    }

    pub fn lookup_adjunct(
        &self,
        kind: ObjectKind,
        id: &str,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<Option<Arc<Adjunct>>> {
        match self.adjunct(kind, id) {
            Some(found) => Ok(Some(found)),
            None => handler.on_dangling_reference(kind, id).map(|_| None),
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.entities.values()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Arc<Location>> {
        self.locations.values()
    }

    pub fn adjuncts(&self, kind: ObjectKind) -> impl Iterator<Item = &Arc<Adjunct>> {
        self.adjunct_table(kind).into_iter().flat_map(|table| table.values())
    }

    /// Catalog items ordered by id.
    pub fn catalog_items_sorted(&self) -> Vec<Arc<CatalogItem>> {
        let mut items: Vec<_> = self.catalog_items.values().cloned().collect();
        items.sort_by(|a, b| a.id().cmp(b.id()));
        items
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Entity => self.entities.len(),
            ObjectKind::Location => self.locations.len(),
            ObjectKind::Policy => self.policies.len(),
            ObjectKind::Enricher => self.enrichers.len(),
            ObjectKind::Feed => self.feeds.len(),
            ObjectKind::CatalogItem => self.catalog_items.len(),
        }
    }

    /// Objects registered across every table.
    pub fn total_count(&self) -> usize {
        ObjectKind::ALL.iter().map(|kind| self.count(*kind)).sum()
    }

    fn adjunct_table(&self, kind: ObjectKind) -> Option<&IndexMap<String, Arc<Adjunct>>> {
        match kind {
            ObjectKind::Policy => Some(&self.policies),
            ObjectKind::Enricher => Some(&self.enrichers),
            ObjectKind::Feed => Some(&self.feeds),
            _ => None,
        }
    }

    fn adjunct_table_mut(&mut self, kind: ObjectKind) -> anyhow::Result<&mut IndexMap<String, Arc<Adjunct>>> {
        match kind {
            ObjectKind::Policy => Ok(&mut self.policies),
            ObjectKind::Enricher => Ok(&mut self.enrichers),
            ObjectKind::Feed => Ok(&mut self.feeds),
            other => Err(anyhow!("{} is not an adjunct kind", other)),
        }
    }
}

impl ReferenceLookup for RebindContext {
    fn resolves(&self, kind: ObjectKind, id: &str) -> bool {
        self.contains(kind, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ExceptionHandler;
    use crate::registry::TypeRegistration;
    use keel_common::{FailureModes, QuorumCheck};

    fn entity(id: &str) -> Arc<Entity> {
        Entity::new(id, Arc::new(TypeRegistration::entity("T")), None, false)
    }

    #[test]
    fn read_only_follows_node_state() {
        assert!(!RebindContext::new(NodeState::Master).unwrap().is_read_only());
        assert!(RebindContext::new(NodeState::HotStandby).unwrap().is_read_only());
        assert!(RebindContext::new(NodeState::HotBackup).unwrap().is_read_only());
        assert!(matches!(
            RebindContext::new(NodeState::Standby),
            Err(RebindError::InvalidNodeState(NodeState::Standby))
        ));
    }

    #[test]
    fn ids_live_in_one_table_only() {
        let mut ctx = RebindContext::new(NodeState::Master).unwrap();
        ctx.register_entity(entity("x")).unwrap();
        let location = Location::new("x", Arc::new(TypeRegistration::location("L")), None, false);
        assert!(ctx.register_location(location).is_err());
        assert!(ctx.register_entity(entity("x")).is_err());
        assert_eq!(ctx.total_count(), 1);
    }

    #[test]
    fn lookup_miss_is_classified_once() {
        let ctx = RebindContext::new(NodeState::Master).unwrap();
        let mut handler = ExceptionHandler::new(FailureModes::default(), QuorumCheck::default()).start();
        assert!(ctx.lookup_entity("ghost", &mut handler).unwrap().is_none());
        assert_eq!(handler.missing(ObjectKind::Entity), vec!["ghost"]);
    }

    #[test]
    fn declared_parents_follow_the_latest_manifest() {
        let mut ctx = RebindContext::new(NodeState::Master).unwrap();
        ctx.declare_parent("c-1", Some("b-1"));
        assert_eq!(ctx.declared_parent("c-1"), Some("b-1"));
        ctx.declare_parent("c-1", None);
        assert_eq!(ctx.declared_parent("c-1"), None);
        assert_eq!(ctx.declared_parent("a-1"), None);
    }

    #[test]
    fn evicted_adjuncts_disappear() {
        let mut ctx = RebindContext::new(NodeState::Master).unwrap();
        let policy = Adjunct::new(
            ObjectKind::Policy,
            "p-1",
            Arc::new(TypeRegistration::policy("P")),
            None,
            false,
        );
        ctx.register_adjunct(policy).unwrap();
        assert!(ctx.unregister_adjunct(ObjectKind::Policy, "p-1").is_some());
        assert!(ctx.adjunct(ObjectKind::Policy, "p-1").is_none());
        assert!(ctx.unregister_adjunct(ObjectKind::Entity, "p-1").is_none());
    }
}
