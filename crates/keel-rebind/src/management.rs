//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Boundary to the live management plane that takes ownership of rebuilt objects."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use keel_persistence::ObjectKind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::{CatalogItem, Entity, Location};

/// How the management plane holds an object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagementMode {
    /// Persisted but not yet loaded on this node.
    UnmanagedPersisted,
    /// Owned and driven by this node.
    ManagedPrimary,
    /// Loaded as a read-only copy.
    LoadedReadOnly,
}

impl fmt::Display for ManagementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ManagementMode::UnmanagedPersisted => "UNMANAGED_PERSISTED",
            ManagementMode::ManagedPrimary => "MANAGED_PRIMARY",
            ManagementMode::LoadedReadOnly => "LOADED_READ_ONLY",
        })
    }
}

/// Before and after modes of one object across a rebind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagementTransitionMode {
    pub before: ManagementMode,
    pub after: ManagementMode,
}

impl ManagementTransitionMode {
    /// Transition for an object given its previous transition, if any.
    pub fn compute(previous: Option<ManagementTransitionMode>, read_only: bool) -> Self {
        let before = previous
            .map(|mode| mode.after)
            .unwrap_or(ManagementMode::UnmanagedPersisted);
        let after = if read_only {
            ManagementMode::LoadedReadOnly
        } else {
            ManagementMode::ManagedPrimary
        };
        Self { before, after }
    }

    /// A master rebinding objects it already owns.
    pub fn is_rebinding_active_again(&self) -> bool {
        self.before == ManagementMode::ManagedPrimary && self.after == ManagementMode::ManagedPrimary
    }

    pub fn was_read_only(&self) -> bool {
        self.before == ManagementMode::LoadedReadOnly
    }
}

impl fmt::Display for ManagementTransitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.before, self.after)
    }
}

/// The live management plane. Rebuilt roots are handed over exactly once per run.
pub trait ManagementPlane: Send + Sync {
    /// Ids currently managed for one kind.
    fn managed_ids(&self, kind: ObjectKind) -> Vec<String>;

    fn last_transition_mode(&self, kind: ObjectKind, id: &str) -> Option<ManagementTransitionMode>;

    fn set_transition_mode(&self, kind: ObjectKind, id: &str, mode: ManagementTransitionMode);

    /// Take ownership of a root location and its descendants.
    fn manage_rebinded_root_location(&self, location: Arc<Location>) -> anyhow::Result<()>;

    /// Take ownership of an application and its descendants.
    fn manage_rebinded_root_entity(&self, application: Arc<Entity>) -> anyhow::Result<()>;

    /// Replace the catalog with the rebuilt items.
    fn install_catalog(&self, items: Vec<Arc<CatalogItem>>) -> anyhow::Result<()>;
}

#[derive(Default)]
struct PlaneState {
    entities: IndexMap<String, Arc<Entity>>,
    applications: IndexMap<String, Arc<Entity>>,
    locations: IndexMap<String, Arc<Location>>,
    catalog: IndexMap<String, Arc<CatalogItem>>,
    modes: HashMap<(ObjectKind, String), ManagementTransitionMode>,
}

/// Management plane kept in memory.
#[derive(Default)]
pub struct InMemoryManagementPlane {
    state: RwLock<PlaneState>,
}

impl InMemoryManagementPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, id: &str) -> Option<Arc<Entity>> {
        self.state.read().entities.get(id).cloned()
    }

    pub fn application(&self, id: &str) -> Option<Arc<Entity>> {
        self.state.read().applications.get(id).cloned()
    }

    pub fn applications(&self) -> Vec<Arc<Entity>> {
        self.state.read().applications.values().cloned().collect()
    }

    pub fn location(&self, id: &str) -> Option<Arc<Location>> {
        self.state.read().locations.get(id).cloned()
    }

    pub fn catalog_item(&self, id: &str) -> Option<Arc<CatalogItem>> {
        self.state.read().catalog.get(id).cloned()
    }

    pub fn catalog_len(&self) -> usize {
        self.state.read().catalog.len()
    }

    /// Forget an object, as a cleanup pass would after reviewing stale ids.
    pub fn unmanage(&self, kind: ObjectKind, id: &str) {
        let mut state = self.state.write();
        match kind {
            ObjectKind::Entity => {
                state.entities.shift_remove(id);
                state.applications.shift_remove(id);
            }
            ObjectKind::Location => {
                state.locations.shift_remove(id);
            }
            _ => {}
        }
        state.modes.remove(&(kind, id.to_owned()));
    }
}

impl fmt::Debug for InMemoryManagementPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryManagementPlane")
            .field("entities", &state.entities.len())
            .field("locations", &state.locations.len())
            .field("catalog", &state.catalog.len())
            .finish()
    }
}

impl ManagementPlane for InMemoryManagementPlane {
    fn managed_ids(&self, kind: ObjectKind) -> Vec<String> {
        let state = self.state.read();
        match kind {
            ObjectKind::Entity => state.entities.keys().cloned().collect(),
            ObjectKind::Location => state.locations.keys().cloned().collect(),
            ObjectKind::CatalogItem => state.catalog.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn last_transition_mode(&self, kind: ObjectKind, id: &str) -> Option<ManagementTransitionMode> {
        self.state.read().modes.get(&(kind, id.to_owned())).copied()
    }

    fn set_transition_mode(&self, kind: ObjectKind, id: &str, mode: ManagementTransitionMode) {
        self.state.write().modes.insert((kind, id.to_owned()), mode);
    }

    fn manage_rebinded_root_location(&self, location: Arc<Location>) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let mut stack = vec![location];
        while let Some(next) = stack.pop() {
            stack.extend(next.children());
            state.locations.insert(next.id().to_owned(), next);
        }
        Ok(())
    }

    fn manage_rebinded_root_entity(&self, application: Arc<Entity>) -> anyhow::Result<()> {
        let mut state = self.state.write();
        for entity in application.descendants_and_self() {
            state.entities.insert(entity.id().to_owned(), entity);
        }
        state
            .applications
            .insert(application.id().to_owned(), application);
        Ok(())
    }

    fn install_catalog(&self, items: Vec<Arc<CatalogItem>>) -> anyhow::Result<()> {
        let mut state = self.state.write();
        state.catalog = items
            .into_iter()
            .map(|item| (item.id().to_owned(), item))
            .collect();
        Ok(())
    }
}
