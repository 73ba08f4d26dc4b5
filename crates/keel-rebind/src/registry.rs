//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Factory registry of implementation types known to the management plane."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Implementation types are registered up front, per scope, instead of being
//! discovered by probing constructors at rebind time.

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use keel_persistence::ObjectKind;
use parking_lot::RwLock;
use serde_json::Value;

use crate::model::Entity;
use crate::values::ValueType;

/// Where an implementation type is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeScope {
    /// Types available without any catalog item.
    Default,
    /// Types contributed by a named bundle, visible through catalog items that list it.
    Bundle(String),
}

impl TypeScope {
    pub fn bundle(name: impl Into<String>) -> Self {
        TypeScope::Bundle(name.into())
    }
}

impl fmt::Display for TypeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeScope::Default => f.write_str("default"),
            TypeScope::Bundle(name) => write!(f, "bundle {}", name),
        }
    }
}

/// How instances of a type are allocated.
#[derive(Debug, Clone, PartialEq)]
pub enum Construction {
    /// Bare allocation with no initialization logic.
    NewStyle,
    /// Deprecated constructor taking a flags map; flags seed the config before reconstruction.
    Legacy { flags: IndexMap<String, Value> },
}

/// Behaviour a registered type contributes to reconstruction.
pub trait ObjectHooks: Send + Sync {
    /// Invoked once the object's memento has been applied.
    fn rebind(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when an adjunct is attached to its owning entity.
    fn on_attach(&self, _adjunct_id: &str, _entity: &Entity) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when a feed starts.
    fn start(&self, _feed_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ObjectHooks for NoopHooks {}

/// One implementation type.
#[derive(Clone)]
pub struct TypeRegistration {
    kind: ObjectKind,
    type_name: String,
    construction: Construction,
    config_keys: IndexMap<String, ValueType>,
    application: bool,
    hooks: Arc<dyn ObjectHooks>,
}

impl TypeRegistration {
    pub fn new(kind: ObjectKind, type_name: impl Into<String>) -> Self {
        Self {
            kind,
            type_name: type_name.into(),
            construction: Construction::NewStyle,
            config_keys: IndexMap::new(),
            application: false,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn entity(type_name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Entity, type_name)
    }

    pub fn location(type_name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Location, type_name)
    }

    pub fn policy(type_name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Policy, type_name)
    }

    pub fn enricher(type_name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Enricher, type_name)
    }

    pub fn feed(type_name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Feed, type_name)
    }

    /// Marks an entity type as a top-level application.
    pub fn application(mut self) -> Self {
        self.application = true;
        self
    }

    pub fn config_key(mut self, key: impl Into<String>, value_type: ValueType) -> Self {
        self.config_keys.insert(key.into(), value_type);
        self
    }

    pub fn legacy(mut self, flags: IndexMap<String, Value>) -> Self {
        self.construction = Construction::Legacy { flags };
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ObjectHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn construction(&self) -> &Construction {
        &self.construction
    }

    pub fn declared_type(&self, key: &str) -> Option<&ValueType> {
        self.config_keys.get(key)
    }

    pub fn is_application(&self) -> bool {
        self.application
    }

    pub fn object_hooks(&self) -> &dyn ObjectHooks {
        self.hooks.as_ref()
    }
}

impl fmt::Debug for TypeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistration")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("construction", &self.construction)
            .field("application", &self.application)
            .finish_non_exhaustive()
    }
}

/// Registry of implementation types, keyed by scope and type name.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: RwLock<IndexMap<(TypeScope, String), Arc<TypeRegistration>>>,
    value_types: RwLock<IndexSet<String>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type in the default scope.
    pub fn register(&self, registration: TypeRegistration) -> Arc<TypeRegistration> {
        self.register_in(TypeScope::Default, registration)
    }

    /// Register a type in the given scope, replacing any earlier registration.
    pub fn register_in(&self, scope: TypeScope, registration: TypeRegistration) -> Arc<TypeRegistration> {
        let registration = Arc::new(registration);
        self.types.write().insert(
            (scope, registration.type_name().to_owned()),
            registration.clone(),
        );
        registration
    }

    /// Make a custom config value type known.
    pub fn register_value_type(&self, name: impl Into<String>) {
        self.value_types.write().insert(name.into());
    }

    pub fn knows_value_type(&self, name: &str) -> bool {
        self.value_types.read().contains(name)
    }

    pub fn resolve(&self, scope: &TypeScope, type_name: &str) -> Option<Arc<TypeRegistration>> {
        self.types
            .read()
            .get(&(scope.clone(), type_name.to_owned()))
            .cloned()
    }

    /// Resolve through the listed bundle scopes, in order.
    pub fn resolve_in_bundles(&self, bundles: &[String], type_name: &str) -> Option<Arc<TypeRegistration>> {
        bundles
            .iter()
            .find_map(|bundle| self.resolve(&TypeScope::Bundle(bundle.clone()), type_name))
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
