//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Persistence abstractions and storage bindings."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ObjectKind;

/// Opaque persisted state: one table per object kind, id to serialized memento.
///
/// Insertion order is preserved so rebinds visit objects in the order they
/// were persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MementoRawData {
    /// Serialized entity mementos.
    #[serde(default)]
    pub entities: IndexMap<String, String>,
    /// Serialized location mementos.
    #[serde(default)]
    pub locations: IndexMap<String, String>,
    /// Serialized policy mementos.
    #[serde(default)]
    pub policies: IndexMap<String, String>,
    /// Serialized enricher mementos.
    #[serde(default)]
    pub enrichers: IndexMap<String, String>,
    /// Serialized feed mementos.
    #[serde(default)]
    pub feeds: IndexMap<String, String>,
    /// Serialized catalog item mementos.
    #[serde(default)]
    pub catalog_items: IndexMap<String, String>,
}

impl MementoRawData {
    /// Create an empty data set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for one kind.
    pub fn table(&self, kind: ObjectKind) -> &IndexMap<String, String> {
        match kind {
            ObjectKind::Entity => &self.entities,
            ObjectKind::Location => &self.locations,
            ObjectKind::Policy => &self.policies,
            ObjectKind::Enricher => &self.enrichers,
            ObjectKind::Feed => &self.feeds,
            ObjectKind::CatalogItem => &self.catalog_items,
        }
    }

    /// Mutable table for one kind.
    pub fn table_mut(&mut self, kind: ObjectKind) -> &mut IndexMap<String, String> {
        match kind {
            ObjectKind::Entity => &mut self.entities,
            ObjectKind::Location => &mut self.locations,
            ObjectKind::Policy => &mut self.policies,
            ObjectKind::Enricher => &mut self.enrichers,
            ObjectKind::Feed => &mut self.feeds,
            ObjectKind::CatalogItem => &mut self.catalog_items,
        }
    }

    /// Insert or replace a serialized memento, returning the previous payload.
    pub fn insert(
        &mut self,
        kind: ObjectKind,
        id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Option<String> {
        self.table_mut(kind).insert(id.into(), payload.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, kind: ObjectKind, id: impl Into<String>, payload: impl Into<String>) -> Self {
        self.insert(kind, id, payload);
        self
    }

    /// Serialized memento for an id, if present.
    pub fn get(&self, kind: ObjectKind, id: &str) -> Option<&str> {
        self.table(kind).get(id).map(String::as_str)
    }

    /// Remove a memento, preserving the order of the remaining entries.
    pub fn remove(&mut self, kind: ObjectKind, id: &str) -> Option<String> {
        self.table_mut(kind).shift_remove(id)
    }

    /// Total number of mementos across all kinds.
    pub fn len(&self) -> usize {
        ObjectKind::ALL.iter().map(|kind| self.table(*kind).len()).sum()
    }

    /// True when nothing has been persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
