//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Memento capture of live objects, the inverse of a rebind."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Memento capture.
//!
//! Produces the mementos a live graph would persist. A rebind of the captured
//! set yields a structurally equal graph.

use std::collections::HashSet;
use std::sync::Arc;

use keel_persistence::ObjectKind;

use crate::memento::{AdjunctMemento, CatalogItemMemento, EntityMemento, FullMemento, LocationMemento};
use crate::model::{Adjunct, CatalogItem, Entity, Location};

pub fn entity_memento(entity: &Entity) -> EntityMemento {
    EntityMemento {
        id: entity.id().to_owned(),
        type_name: entity.type_name().to_owned(),
        catalog_item_id: entity.catalog_item_id().map(str::to_owned),
        display_name: entity.display_name(),
        description: entity.description(),
        tags: entity.tags(),
        parent: entity.parent_id(),
        children: entity.child_ids(),
        members: entity.member_ids(),
        locations: entity.location_ids(),
        policies: entity.adjunct_ids(ObjectKind::Policy),
        enrichers: entity.adjunct_ids(ObjectKind::Enricher),
        feeds: entity.adjunct_ids(ObjectKind::Feed),
        effectors: entity.effectors(),
        config: entity.config_map(),
        config_types: Default::default(),
        attributes: entity.attributes(),
    }
}

pub fn location_memento(location: &Location) -> LocationMemento {
    LocationMemento {
        id: location.id().to_owned(),
        type_name: location.type_name().to_owned(),
        catalog_item_id: location.catalog_item_id().map(str::to_owned),
        display_name: location.display_name(),
        tags: location.tags(),
        parent: location.parent().map(|parent| parent.id().to_owned()),
        children: location.child_ids(),
        config: location.config_map(),
        config_types: Default::default(),
    }
}

pub fn adjunct_memento(adjunct: &Adjunct) -> AdjunctMemento {
    AdjunctMemento {
        kind: adjunct.kind(),
        id: adjunct.id().to_owned(),
        type_name: adjunct.type_name().to_owned(),
        catalog_item_id: adjunct.catalog_item_id().map(str::to_owned),
        display_name: adjunct.display_name(),
        unique_tag: adjunct.unique_tag(),
        tags: adjunct.tags(),
        config: adjunct.config_map(),
        config_types: Default::default(),
    }
}

pub fn catalog_item_memento(item: &CatalogItem) -> CatalogItemMemento {
    let state = item.snapshot();
    CatalogItemMemento {
        id: item.id().to_owned(),
        symbolic_name: state.symbolic_name,
        version: state.version,
        item_type: state.item_type,
        plan_type: state.plan_type,
        libraries: state.libraries,
        display_name: state.display_name,
        description: state.description,
        tags: state.tags,
        deprecated: state.deprecated,
        disabled: state.disabled,
    }
}

/// Mementos for every object reachable from `applications` and `locations`.
///
/// Locations attached to entities are included along with their whole tree.
pub fn capture_graph(applications: &[Arc<Entity>], locations: &[Arc<Location>]) -> FullMemento {
    let mut memento = FullMemento::default();
    let mut location_roots: Vec<Arc<Location>> = locations.to_vec();

    for application in applications {
        if application.parent_id().is_none() {
            memento.application_ids.push(application.id().to_owned());
        }
        for entity in application.descendants_and_self() {
            if memento.entities.contains_key(entity.id()) {
                continue;
            }
            location_roots.extend(entity.locations());
            for kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
                for adjunct in entity.adjuncts(kind) {
                    if let Some(table) = memento.adjuncts_mut(kind) {
                        table.insert(adjunct.id().to_owned(), adjunct_memento(&adjunct));
                    }
                }
            }
            memento
                .entities
                .insert(entity.id().to_owned(), entity_memento(&entity));
        }
    }

    let mut seen = HashSet::new();
    for location in location_roots {
        let mut root = location;
        let mut climbed = HashSet::new();
        while let Some(parent) = root.parent() {
            if !climbed.insert(parent.id().to_owned()) {
                break;
            }
            root = parent;
        }
        let mut stack = vec![root];
        while let Some(next) = stack.pop() {
            if !seen.insert(next.id().to_owned()) {
                continue;
            }
            stack.extend(next.children());
            memento
                .locations
                .insert(next.id().to_owned(), location_memento(&next));
        }
    }
    memento
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Configurable;
    use crate::registry::TypeRegistration;
    use serde_json::json;

    #[test]
    fn captures_hierarchy_and_attached_locations() {
        let app = Entity::new("app", Arc::new(TypeRegistration::entity("App")), None, false);
        let child = Entity::new("child", Arc::new(TypeRegistration::entity("Node")), None, false);
        app.add_child(child.clone());
        child.set_parent(&app);
        app.with_common(|common| {
            common.config.insert("name".into(), json!("web"));
        });

        let region = Location::new("region", Arc::new(TypeRegistration::location("Region")), None, false);
        let zone = Location::new("zone", Arc::new(TypeRegistration::location("Zone")), None, false);
        region.add_child(zone.clone());
        zone.set_parent(&region);
        child.state.write().locations.push(zone);

        let memento = capture_graph(&[app], &[]);
        assert_eq!(memento.application_ids, vec!["app"]);
        assert_eq!(memento.entities["child"].parent.as_deref(), Some("app"));
        assert_eq!(memento.entities["app"].config["name"], json!("web"));
        assert_eq!(memento.entities["child"].locations, vec!["zone"]);
        assert!(memento.locations.contains_key("region"));
        assert_eq!(memento.locations["zone"].parent.as_deref(), Some("region"));
    }
}
