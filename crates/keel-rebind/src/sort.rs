//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Parent-first ordering of hierarchical mementos."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::collections::HashSet;

use indexmap::IndexMap;

use crate::memento::Hierarchical;

/// Orders mementos so every parent precedes its children.
///
/// Siblings keep their persisted order. Parents missing from the set end the
/// ancestor walk; cycles are broken at the first repeated id.
pub fn sort_parent_first<M: Hierarchical>(mementos: &IndexMap<String, M>) -> Vec<&M> {
    let mut ordered = Vec::with_capacity(mementos.len());
    let mut placed: HashSet<&str> = HashSet::with_capacity(mementos.len());

    for memento in mementos.values() {
        let mut chain = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut cursor = Some(memento);
        while let Some(current) = cursor {
            let id = current.node_id();
            if placed.contains(id) || !seen.insert(id) {
                break;
            }
            chain.push(current);
            cursor = current.parent_id().and_then(|parent| mementos.get(parent));
        }
        for item in chain.into_iter().rev() {
            placed.insert(item.node_id());
            ordered.push(item);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::EntityMemento;
    use proptest::prelude::*;

    fn memento(id: &str, parent: Option<&str>) -> EntityMemento {
        let mut m = EntityMemento::new(id, "T");
        m.parent = parent.map(str::to_owned);
        m
    }

    fn index(items: Vec<EntityMemento>) -> IndexMap<String, EntityMemento> {
        items.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    #[test]
    fn grandchild_listed_first_is_moved_after_ancestors() {
        let set = index(vec![
            memento("c", Some("b")),
            memento("a", None),
            memento("b", Some("a")),
        ]);
        let ids: Vec<_> = sort_parent_first(&set).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_parent_and_cycles_terminate() {
        let set = index(vec![
            memento("orphan", Some("deleted")),
            memento("x", Some("y")),
            memento("y", Some("x")),
        ]);
        let sorted = sort_parent_first(&set);
        assert_eq!(sorted.len(), 3);
    }

    proptest! {
        #[test]
        fn every_parent_precedes_its_children(parents in prop::collection::vec(prop::option::of(0usize..40), 1..40)) {
            // entity i may only point at a lower index, which keeps the input acyclic
            let items: Vec<_> = parents
                .iter()
                .enumerate()
                .map(|(i, parent)| {
                    let parent = parent.filter(|p| *p < i).map(|p| format!("e{p}"));
                    memento(&format!("e{i}"), parent.as_deref())
                })
                .rev()
                .collect();
            let set = index(items);
            let sorted = sort_parent_first(&set);
            prop_assert_eq!(sorted.len(), set.len());
            let position: std::collections::HashMap<_, _> = sorted
                .iter()
                .enumerate()
                .map(|(pos, m)| (m.id.clone(), pos))
                .collect();
            for m in set.values() {
                if let Some(parent) = &m.parent {
                    prop_assert!(position[parent] < position[&m.id]);
                }
            }
        }
    }
}
