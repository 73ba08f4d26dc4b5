//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Immutable persisted records consumed by the rebind engine."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Mementos and manifests.
//!
//! A manifest carries just enough to allocate objects early in a run; the
//! full memento set is decoded once every entity and location id is known.

use indexmap::IndexMap;
use keel_persistence::ObjectKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version assumed for catalog items referenced without one.
pub const DEFAULT_CATALOG_VERSION: &str = "0.0.0-SNAPSHOT";

/// Builds the `symbolic:version` id of a catalog item.
pub fn versioned_id(symbolic_name: &str, version: &str) -> String {
    format!("{}:{}", symbolic_name, version)
}

/// Symbolic name part of a `symbolic:version` id; ids without a version are returned as-is.
pub fn symbolic_name_of(catalog_item_id: &str) -> &str {
    catalog_item_id
        .split_once(':')
        .map(|(name, _)| name)
        .unwrap_or(catalog_item_id)
}

/// Fields every memento shares.
pub trait Memento {
    fn kind(&self) -> ObjectKind;
    fn id(&self) -> &str;
    fn type_name(&self) -> &str;
    fn catalog_item_id(&self) -> Option<&str>;
    fn display_name(&self) -> Option<&str>;
    fn tags(&self) -> &[String];
    fn config(&self) -> &IndexMap<String, Value>;
    fn config_types(&self) -> &IndexMap<String, String>;
}

/// Mementos that form a parent/child tree.
pub trait Hierarchical {
    fn node_id(&self) -> &str;
    fn parent_id(&self) -> Option<&str>;
}

/// Persisted state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMemento {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub enrichers: Vec<String>,
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub effectors: Vec<String>,
    #[serde(default)]
    pub config: IndexMap<String, Value>,
    /// Declared value type recorded for each config key when it was persisted.
    #[serde(default)]
    pub config_types: IndexMap<String, String>,
    #[serde(default)]
    pub attributes: IndexMap<String, Value>,
}

impl EntityMemento {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            catalog_item_id: None,
            display_name: None,
            description: None,
            tags: Vec::new(),
            parent: None,
            children: Vec::new(),
            members: Vec::new(),
            locations: Vec::new(),
            policies: Vec::new(),
            enrichers: Vec::new(),
            feeds: Vec::new(),
            effectors: Vec::new(),
            config: IndexMap::new(),
            config_types: IndexMap::new(),
            attributes: IndexMap::new(),
        }
    }
}

/// Persisted state of one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMemento {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub config: IndexMap<String, Value>,
    #[serde(default)]
    pub config_types: IndexMap<String, String>,
}

impl LocationMemento {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            catalog_item_id: None,
            display_name: None,
            tags: Vec::new(),
            parent: None,
            children: Vec::new(),
            config: IndexMap::new(),
            config_types: IndexMap::new(),
        }
    }
}

/// Persisted state of a policy, enricher, or feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjunctMemento {
    /// Which adjunct table the memento came from; filled in by the store.
    #[serde(skip, default = "default_adjunct_kind")]
    pub kind: ObjectKind,
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_tag: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: IndexMap<String, Value>,
    #[serde(default)]
    pub config_types: IndexMap<String, String>,
}

fn default_adjunct_kind() -> ObjectKind {
    ObjectKind::Policy
}

impl AdjunctMemento {
    pub fn new(kind: ObjectKind, id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            type_name: type_name.into(),
            catalog_item_id: None,
            display_name: None,
            unique_tag: None,
            tags: Vec::new(),
            config: IndexMap::new(),
            config_types: IndexMap::new(),
        }
    }
}

/// Kind of object a catalog item plans.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogItemType {
    #[default]
    Entity,
    Template,
    Location,
    Policy,
    Enricher,
}

/// Persisted catalog item.
///
/// Catalog items are complete in the manifest: they are rebuilt before
/// anything else so other objects can resolve their types through them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItemMemento {
    pub id: String,
    pub symbolic_name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub item_type: CatalogItemType,
    /// Implementation type the item resolves to.
    pub plan_type: String,
    /// Bundle scopes searched when loading `plan_type`.
    #[serde(default)]
    pub libraries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub disabled: bool,
}

fn default_version() -> String {
    DEFAULT_CATALOG_VERSION.to_owned()
}

impl CatalogItemMemento {
    /// New item whose id is `symbolic:version`.
    pub fn new(
        symbolic_name: impl Into<String>,
        version: impl Into<String>,
        plan_type: impl Into<String>,
    ) -> Self {
        let symbolic_name = symbolic_name.into();
        let version = version.into();
        Self {
            id: versioned_id(&symbolic_name, &version),
            symbolic_name,
            version,
            item_type: CatalogItemType::Entity,
            plan_type: plan_type.into(),
            libraries: Vec::new(),
            display_name: None,
            description: None,
            tags: Vec::new(),
            deprecated: false,
            disabled: false,
        }
    }

    pub fn with_library(mut self, scope: impl Into<String>) -> Self {
        self.libraries.push(scope.into());
        self
    }
}

/// Early-phase record for an entity or location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectManifest {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Manifest set decoded in phase 1.
#[derive(Debug, Clone, Default)]
pub struct MementoManifest {
    pub entities: IndexMap<String, ObjectManifest>,
    pub locations: IndexMap<String, ObjectManifest>,
    pub catalog_items: IndexMap<String, CatalogItemMemento>,
}

impl MementoManifest {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.locations.is_empty() && self.catalog_items.is_empty()
    }
}

/// Full memento set decoded in phase 4.
#[derive(Debug, Clone, Default)]
pub struct FullMemento {
    pub entities: IndexMap<String, EntityMemento>,
    pub locations: IndexMap<String, LocationMemento>,
    pub policies: IndexMap<String, AdjunctMemento>,
    pub enrichers: IndexMap<String, AdjunctMemento>,
    pub feeds: IndexMap<String, AdjunctMemento>,
    /// Top-level applications, in persisted order.
    pub application_ids: Vec<String>,
}

impl FullMemento {
    pub fn adjuncts(&self, kind: ObjectKind) -> Option<&IndexMap<String, AdjunctMemento>> {
        match kind {
            ObjectKind::Policy => Some(&self.policies),
            ObjectKind::Enricher => Some(&self.enrichers),
            ObjectKind::Feed => Some(&self.feeds),
            _ => None,
        }
    }

    pub fn adjuncts_mut(&mut self, kind: ObjectKind) -> Option<&mut IndexMap<String, AdjunctMemento>> {
        match kind {
            ObjectKind::Policy => Some(&mut self.policies),
            ObjectKind::Enricher => Some(&mut self.enrichers),
            ObjectKind::Feed => Some(&mut self.feeds),
            _ => None,
        }
    }
}

macro_rules! impl_memento {
    ($ty:ty, $this:ident => $kind:expr) => {
        impl Memento for $ty {
            fn kind(&self) -> ObjectKind {
                let $this = self;
                $kind
            }
            fn id(&self) -> &str {
                &self.id
            }
            fn type_name(&self) -> &str {
                &self.type_name
            }
            fn catalog_item_id(&self) -> Option<&str> {
                self.catalog_item_id.as_deref()
            }
            fn display_name(&self) -> Option<&str> {
                self.display_name.as_deref()
            }
            fn tags(&self) -> &[String] {
                &self.tags
            }
            fn config(&self) -> &IndexMap<String, Value> {
                &self.config
            }
            fn config_types(&self) -> &IndexMap<String, String> {
                &self.config_types
            }
        }
    };
}

impl_memento!(EntityMemento, _m => ObjectKind::Entity);
impl_memento!(LocationMemento, _m => ObjectKind::Location);
impl_memento!(AdjunctMemento, m => m.kind);

impl Hierarchical for EntityMemento {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}

impl Hierarchical for LocationMemento {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}

impl Hierarchical for ObjectManifest {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}
