//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Live management-plane objects rebuilt by a rebind run."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Live objects.
//!
//! Objects are allocated bare (identity only) and filled in by rebind support.
//! Parents own their children; back-edges (parent, owning entity, group
//! membership) are weak.

use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use keel_persistence::ObjectKind;
use parking_lot::RwLock;
use serde_json::Value;

use crate::memento::CatalogItemType;
use crate::registry::TypeRegistration;

/// Fields shared by every rebuilt object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonState {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub config: IndexMap<String, Value>,
}

/// Objects whose config is restored key by key.
pub trait Configurable {
    fn kind(&self) -> ObjectKind;
    fn id(&self) -> &str;
    fn registration(&self) -> &TypeRegistration;
    fn with_common<R>(&self, f: impl FnOnce(&mut CommonState) -> R) -> R;
}

#[derive(Default)]
pub(crate) struct EntityState {
    pub(crate) common: CommonState,
    pub(crate) attributes: IndexMap<String, Value>,
    pub(crate) effectors: Vec<String>,
    pub(crate) parent: Option<Weak<Entity>>,
    pub(crate) children: Vec<Arc<Entity>>,
    pub(crate) members: Vec<Weak<Entity>>,
    pub(crate) locations: Vec<Arc<Location>>,
    pub(crate) policies: Vec<Arc<Adjunct>>,
    pub(crate) enrichers: Vec<Arc<Adjunct>>,
    pub(crate) feeds: Vec<Arc<Adjunct>>,
}

/// A rebuilt entity. Entities without a parent are applications.
pub struct Entity {
    id: String,
    catalog_item_id: Option<String>,
    read_only: bool,
    registration: Arc<TypeRegistration>,
    pub(crate) state: RwLock<EntityState>,
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        registration: Arc<TypeRegistration>,
        catalog_item_id: Option<String>,
        read_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            catalog_item_id,
            read_only,
            registration,
            state: RwLock::new(EntityState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.registration.type_name()
    }

    pub fn catalog_item_id(&self) -> Option<&str> {
        self.catalog_item_id.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_application(&self) -> bool {
        self.registration.is_application()
    }

    pub fn display_name(&self) -> Option<String> {
        self.state.read().common.display_name.clone()
    }

    pub fn description(&self) -> Option<String> {
        self.state.read().common.description.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.state.read().common.tags.clone()
    }

    pub fn config(&self, key: &str) -> Option<Value> {
        self.state.read().common.config.get(key).cloned()
    }

    pub fn config_map(&self) -> IndexMap<String, Value> {
        self.state.read().common.config.clone()
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.state.read().attributes.get(key).cloned()
    }

    pub fn attributes(&self) -> IndexMap<String, Value> {
        self.state.read().attributes.clone()
    }

    pub fn effectors(&self) -> Vec<String> {
        self.state.read().effectors.clone()
    }

    pub fn parent(&self) -> Option<Arc<Entity>> {
        self.state.read().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_id(&self) -> Option<String> {
        self.parent().map(|p| p.id.clone())
    }

    pub fn children(&self) -> Vec<Arc<Entity>> {
        self.state.read().children.clone()
    }

    pub fn child_ids(&self) -> Vec<String> {
        self.state.read().children.iter().map(|c| c.id.clone()).collect()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.state
            .read()
            .members
            .iter()
            .filter_map(Weak::upgrade)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn locations(&self) -> Vec<Arc<Location>> {
        self.state.read().locations.clone()
    }

    pub fn location_ids(&self) -> Vec<String> {
        self.state.read().locations.iter().map(|l| l.id().to_owned()).collect()
    }

    pub fn adjuncts(&self, kind: ObjectKind) -> Vec<Arc<Adjunct>> {
        let state = self.state.read();
        match kind {
            ObjectKind::Policy => state.policies.clone(),
            ObjectKind::Enricher => state.enrichers.clone(),
            ObjectKind::Feed => state.feeds.clone(),
            _ => Vec::new(),
        }
    }

    pub fn adjunct_ids(&self, kind: ObjectKind) -> Vec<String> {
        self.adjuncts(kind).iter().map(|a| a.id().to_owned()).collect()
    }

    /// This entity followed by all of its descendants, depth first.
    pub fn descendants_and_self(self: &Arc<Self>) -> Vec<Arc<Entity>> {
        let mut out = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(next) = stack.pop() {
            let children = next.children();
            out.push(next);
            stack.extend(children.into_iter().rev());
        }
        out
    }

    pub(crate) fn add_child(&self, child: Arc<Entity>) {
        let mut state = self.state.write();
        if !state.children.iter().any(|c| c.id == child.id) {
            state.children.push(child);
        }
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Entity>) {
        self.state.write().parent = Some(Arc::downgrade(parent));
    }

    pub(crate) fn attach_adjunct(&self, adjunct: Arc<Adjunct>) {
        let mut state = self.state.write();
        let list = match adjunct.kind() {
            ObjectKind::Policy => &mut state.policies,
            ObjectKind::Enricher => &mut state.enrichers,
            _ => &mut state.feeds,
        };
        if !list.iter().any(|a| a.id() == adjunct.id()) {
            list.push(adjunct);
        }
    }
}

impl Configurable for Entity {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Entity
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn registration(&self) -> &TypeRegistration {
        &self.registration
    }

    fn with_common<R>(&self, f: impl FnOnce(&mut CommonState) -> R) -> R {
        f(&mut self.state.write().common)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct LocationState {
    pub(crate) common: CommonState,
    pub(crate) parent: Option<Weak<Location>>,
    pub(crate) children: Vec<Arc<Location>>,
}

/// A rebuilt location.
pub struct Location {
    id: String,
    catalog_item_id: Option<String>,
    read_only: bool,
    registration: Arc<TypeRegistration>,
    pub(crate) state: RwLock<LocationState>,
}

impl Location {
    pub fn new(
        id: impl Into<String>,
        registration: Arc<TypeRegistration>,
        catalog_item_id: Option<String>,
        read_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            catalog_item_id,
            read_only,
            registration,
            state: RwLock::new(LocationState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.registration.type_name()
    }

    pub fn catalog_item_id(&self) -> Option<&str> {
        self.catalog_item_id.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn display_name(&self) -> Option<String> {
        self.state.read().common.display_name.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.state.read().common.tags.clone()
    }

    pub fn config(&self, key: &str) -> Option<Value> {
        self.state.read().common.config.get(key).cloned()
    }

    pub fn config_map(&self) -> IndexMap<String, Value> {
        self.state.read().common.config.clone()
    }

    pub fn parent(&self) -> Option<Arc<Location>> {
        self.state.read().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn child_ids(&self) -> Vec<String> {
        self.state.read().children.iter().map(|c| c.id.clone()).collect()
    }

    pub fn children(&self) -> Vec<Arc<Location>> {
        self.state.read().children.clone()
    }

    pub(crate) fn add_child(&self, child: Arc<Location>) {
        let mut state = self.state.write();
        if !state.children.iter().any(|c| c.id == child.id) {
            state.children.push(child);
        }
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Location>) {
        self.state.write().parent = Some(Arc::downgrade(parent));
    }
}

impl Configurable for Location {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Location
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn registration(&self) -> &TypeRegistration {
        &self.registration
    }

    fn with_common<R>(&self, f: impl FnOnce(&mut CommonState) -> R) -> R {
        f(&mut self.state.write().common)
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub(crate) struct AdjunctState {
    pub(crate) common: CommonState,
    pub(crate) unique_tag: Option<String>,
    pub(crate) entity: Option<Weak<Entity>>,
    pub(crate) running: bool,
}

/// A rebuilt policy, enricher, or feed.
pub struct Adjunct {
    kind: ObjectKind,
    id: String,
    catalog_item_id: Option<String>,
    read_only: bool,
    registration: Arc<TypeRegistration>,
    pub(crate) state: RwLock<AdjunctState>,
}

impl Adjunct {
    pub fn new(
        kind: ObjectKind,
        id: impl Into<String>,
        registration: Arc<TypeRegistration>,
        catalog_item_id: Option<String>,
        read_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            id: id.into(),
            catalog_item_id,
            read_only,
            registration,
            state: RwLock::new(AdjunctState::default()),
        })
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        self.registration.type_name()
    }

    pub fn catalog_item_id(&self) -> Option<&str> {
        self.catalog_item_id.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn display_name(&self) -> Option<String> {
        self.state.read().common.display_name.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.state.read().common.tags.clone()
    }

    pub fn config(&self, key: &str) -> Option<Value> {
        self.state.read().common.config.get(key).cloned()
    }

    pub fn config_map(&self) -> IndexMap<String, Value> {
        self.state.read().common.config.clone()
    }

    pub fn unique_tag(&self) -> Option<String> {
        self.state.read().unique_tag.clone()
    }

    pub fn entity(&self) -> Option<Arc<Entity>> {
        self.state.read().entity.as_ref().and_then(Weak::upgrade)
    }

    /// Only feeds run; other adjuncts always report false.
    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub(crate) fn set_entity(&self, entity: &Arc<Entity>) {
        self.state.write().entity = Some(Arc::downgrade(entity));
    }

    pub(crate) fn start(&self) -> anyhow::Result<()> {
        if self.kind != ObjectKind::Feed {
            return Ok(());
        }
        self.registration.object_hooks().start(&self.id)?;
        self.state.write().running = true;
        Ok(())
    }
}

impl Configurable for Adjunct {
    fn kind(&self) -> ObjectKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn registration(&self) -> &TypeRegistration {
        &self.registration
    }

    fn with_common<R>(&self, f: impl FnOnce(&mut CommonState) -> R) -> R {
        f(&mut self.state.write().common)
    }
}

impl fmt::Debug for Adjunct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adjunct")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("type", &self.type_name())
            .finish_non_exhaustive()
    }
}

/// Catalog item fields restored from its memento.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogItemState {
    pub symbolic_name: String,
    pub version: String,
    pub item_type: CatalogItemType,
    pub plan_type: String,
    pub libraries: Vec<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub deprecated: bool,
    pub disabled: bool,
}

/// A rebuilt catalog item.
#[derive(Debug)]
pub struct CatalogItem {
    id: String,
    read_only: bool,
    pub(crate) state: RwLock<CatalogItemState>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>, read_only: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            read_only,
            state: RwLock::new(CatalogItemState::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn symbolic_name(&self) -> String {
        self.state.read().symbolic_name.clone()
    }

    pub fn version(&self) -> String {
        self.state.read().version.clone()
    }

    pub fn plan_type(&self) -> String {
        self.state.read().plan_type.clone()
    }

    pub fn libraries(&self) -> Vec<String> {
        self.state.read().libraries.clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.read().disabled
    }

    pub fn is_deprecated(&self) -> bool {
        self.state.read().deprecated
    }

    pub fn snapshot(&self) -> CatalogItemState {
        self.state.read().clone()
    }
}
