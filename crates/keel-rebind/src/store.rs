//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Memento store adapter decoding raw persisted data."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Memento store adapter.
//!
//! Decoding is a pure function over the raw tables. Malformed records and
//! unresolved references are reported through the exception handler; only a
//! handler decision to abort turns into an `Err`.

use anyhow::Context as _;
use indexmap::IndexMap;
use keel_common::RebindConfig;
use keel_persistence::{MementoRawData, ObjectKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::ReferenceLookup;
use crate::error::{RebindError, Result};
use crate::handler::ActiveExceptionHandler;
use crate::memento::{
    AdjunctMemento, CatalogItemMemento, EntityMemento, FullMemento, LocationMemento, MementoManifest,
    ObjectManifest,
};
use crate::values::ObjectRef;

/// Adjunct kinds whose persisted mementos a run reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjunctKinds {
    pub policies: bool,
    pub enrichers: bool,
    pub feeds: bool,
}

impl AdjunctKinds {
    pub const ALL: AdjunctKinds = AdjunctKinds {
        policies: true,
        enrichers: true,
        feeds: true,
    };

    pub fn from_config(config: &RebindConfig) -> Self {
        Self {
            policies: config.persist_policies,
            enrichers: config.persist_enrichers,
            feeds: config.persist_feeds,
        }
    }

    pub fn enabled(&self, kind: ObjectKind) -> bool {
        match kind {
            ObjectKind::Policy => self.policies,
            ObjectKind::Enricher => self.enrichers,
            ObjectKind::Feed => self.feeds,
            _ => false,
        }
    }
}

/// Decodes raw persisted data into manifests and mementos.
pub trait MementoStore: Send + Sync {
    fn load_manifest(
        &self,
        raw: &MementoRawData,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<MementoManifest>;

    /// Adjunct tables of kinds not in `adjuncts` are neither decoded nor
    /// valid reference targets.
    fn load_memento(
        &self,
        raw: &MementoRawData,
        lookup: &dyn ReferenceLookup,
        adjuncts: AdjunctKinds,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<FullMemento>;
}

/// Store adapter for JSON-encoded mementos.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMementoStore;

impl JsonMementoStore {
    pub fn new() -> Self {
        Self
    }

    /// Serialize a memento into the payload format this adapter reads.
    pub fn encode<M: Serialize>(memento: &M) -> Result<String> {
        serde_json::to_string(memento).map_err(|err| RebindError::Store(err.to_string()))
    }

    /// Raw data for a complete memento set plus catalog items.
    pub fn encode_all(memento: &FullMemento, catalog: &[CatalogItemMemento]) -> Result<MementoRawData> {
        let mut raw = MementoRawData::new();
        for (id, m) in &memento.entities {
            raw.insert(ObjectKind::Entity, id.clone(), Self::encode(m)?);
        }
        for (id, m) in &memento.locations {
            raw.insert(ObjectKind::Location, id.clone(), Self::encode(m)?);
        }
        for kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
            for (id, m) in memento.adjuncts(kind).into_iter().flatten() {
                raw.insert(kind, id.clone(), Self::encode(m)?);
            }
        }
        for item in catalog {
            raw.insert(ObjectKind::CatalogItem, item.id.clone(), Self::encode(item)?);
        }
        Ok(raw)
    }
}

fn decode<T: DeserializeOwned>(id: &str, payload: &str) -> anyhow::Result<T> {
    serde_json::from_str(payload).with_context(|| format!("malformed payload for {}", id))
}

fn check_id(table_id: &str, payload_id: &str) -> anyhow::Result<()> {
    if table_id == payload_id {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "payload id {} does not match persisted id {}",
            payload_id,
            table_id
        ))
    }
}

/// Replace every reference that will not resolve with `null`.
fn resolve_references(
    value: &mut Value,
    raw: &MementoRawData,
    lookup: &dyn ReferenceLookup,
    adjuncts: AdjunctKinds,
    handler: &mut ActiveExceptionHandler,
) -> Result<()> {
    if let Some(parsed) = ObjectRef::from_value(value) {
        let resolved = match parsed {
            Ok(reference) => {
                // adjuncts are allocated after mementos load, so check the raw tables
                let exists = if reference.kind.is_adjunct() {
                    adjuncts.enabled(reference.kind) && raw.get(reference.kind, &reference.id).is_some()
                } else {
                    lookup.resolves(reference.kind, &reference.id)
                };
                if !exists {
                    handler.on_dangling_reference(reference.kind, &reference.id)?;
                }
                exists
            }
            Err(err) => {
                handler.warn(format!("Rebind: dropping {}", err));
                false
            }
        };
        if !resolved {
            *value = Value::Null;
        }
        return Ok(());
    }
    match value {
        Value::Array(items) => {
            for item in items {
                resolve_references(item, raw, lookup, adjuncts, handler)?;
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                resolve_references(item, raw, lookup, adjuncts, handler)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_map(
    values: &mut IndexMap<String, Value>,
    raw: &MementoRawData,
    lookup: &dyn ReferenceLookup,
    adjuncts: AdjunctKinds,
    handler: &mut ActiveExceptionHandler,
) -> Result<()> {
    for value in values.values_mut() {
        resolve_references(value, raw, lookup, adjuncts, handler)?;
    }
    Ok(())
}

impl MementoStore for JsonMementoStore {
    fn load_manifest(
        &self,
        raw: &MementoRawData,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<MementoManifest> {
        let mut manifest = MementoManifest::default();
        for (kind, target) in [
            (ObjectKind::Entity, &mut manifest.entities),
            (ObjectKind::Location, &mut manifest.locations),
        ] {
            for (id, payload) in raw.table(kind) {
                match decode::<ObjectManifest>(id, payload)
                    .and_then(|m| check_id(id, &m.id).map(|_| m))
                {
                    Ok(m) => {
                        target.insert(id.clone(), m);
                    }
                    Err(err) => handler.on_load_memento_failed(kind, id, err)?,
                }
            }
        }
        for (id, payload) in raw.table(ObjectKind::CatalogItem) {
            match decode::<CatalogItemMemento>(id, payload)
                .and_then(|m| check_id(id, &m.id).map(|_| m))
            {
                Ok(m) => {
                    manifest.catalog_items.insert(id.clone(), m);
                }
                Err(err) => handler.on_load_memento_failed(ObjectKind::CatalogItem, id, err)?,
            }
        }
        Ok(manifest)
    }

    fn load_memento(
        &self,
        raw: &MementoRawData,
        lookup: &dyn ReferenceLookup,
        adjuncts: AdjunctKinds,
        handler: &mut ActiveExceptionHandler,
    ) -> Result<FullMemento> {
        let mut memento = FullMemento::default();

        for (id, payload) in raw.table(ObjectKind::Entity) {
            match decode::<EntityMemento>(id, payload).and_then(|m| check_id(id, &m.id).map(|_| m)) {
                Ok(mut m) => {
                    resolve_map(&mut m.config, raw, lookup, adjuncts, handler)?;
                    resolve_map(&mut m.attributes, raw, lookup, adjuncts, handler)?;
                    if m.parent.is_none() {
                        memento.application_ids.push(id.clone());
                    }
                    memento.entities.insert(id.clone(), m);
                }
                Err(err) => handler.on_load_memento_failed(ObjectKind::Entity, id, err)?,
            }
        }

        for (id, payload) in raw.table(ObjectKind::Location) {
            match decode::<LocationMemento>(id, payload).and_then(|m| check_id(id, &m.id).map(|_| m)) {
                Ok(mut m) => {
                    resolve_map(&mut m.config, raw, lookup, adjuncts, handler)?;
                    memento.locations.insert(id.clone(), m);
                }
                Err(err) => handler.on_load_memento_failed(ObjectKind::Location, id, err)?,
            }
        }

        for kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
            if !adjuncts.enabled(kind) {
                continue;
            }
            for (id, payload) in raw.table(kind) {
                match decode::<AdjunctMemento>(id, payload).and_then(|m| check_id(id, &m.id).map(|_| m)) {
                    Ok(mut m) => {
                        m.kind = kind;
                        resolve_map(&mut m.config, raw, lookup, adjuncts, handler)?;
                        if let Some(table) = memento.adjuncts_mut(kind) {
                            table.insert(id.clone(), m);
                        }
                    }
                    Err(err) => handler.on_load_memento_failed(kind, id, err)?,
                }
            }
        }

        Ok(memento)
    }
}
