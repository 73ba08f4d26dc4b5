//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "End-to-end rebind runs through the manager against an in-memory plane."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use keel_persistence::save_snapshot;
use keel_rebind::{
    capture_graph, AdjunctMemento, CatalogInitialization, CatalogItem, CatalogItemMemento, Entity,
    EntityMemento, FailureMode, FullMemento, InMemoryManagementPlane, InMemorySource, JsonMementoStore,
    Location, LocationMemento, ManagementMode, ManagementPlane, ManagementTransitionMode, MementoRawData,
    NodeState, ObjectHooks, ObjectKind, ObjectRef, QuorumCheck, RebindConfig, RebindError, RebindManager,
    RebindMetrics, SnapshotFileSource, TypeRegistration, TypeRegistry, TypeScope,
};
use prometheus::Registry;
use proptest::prelude::*;
use serde_json::{json, Value};

struct FailingRebind;

impl ObjectHooks for FailingRebind {
    fn rebind(&self, id: &str) -> anyhow::Result<()> {
        Err(anyhow!("{} refuses to rebind", id))
    }
}

#[derive(Default)]
struct CountingStarts(AtomicUsize);

impl ObjectHooks for CountingStarts {
    fn start(&self, _feed_id: &str) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn registry() -> TypeRegistry {
    let types = TypeRegistry::new();
    types.register(TypeRegistration::entity("TestEntity").application());
    types.register(TypeRegistration::entity("TestChild"));
    types.register(TypeRegistration::location("SshMachine"));
    types.register(TypeRegistration::policy("AutoScaler"));
    types.register(TypeRegistration::enricher("Aggregator"));
    types.register(TypeRegistration::feed("HttpFeed"));
    types
}

struct Harness {
    manager: RebindManager,
    plane: Arc<InMemoryManagementPlane>,
    source: Arc<InMemorySource>,
}

fn harness_with(config: RebindConfig, types: TypeRegistry, raw: MementoRawData) -> Harness {
    let plane = Arc::new(InMemoryManagementPlane::new());
    let source = Arc::new(InMemorySource::new(raw));
    let manager = RebindManager::new(config, Arc::new(types), source.clone(), plane.clone());
    Harness {
        manager,
        plane,
        source,
    }
}

fn harness(config: RebindConfig, raw: MementoRawData) -> Harness {
    harness_with(config, registry(), raw)
}

fn encode(memento: &FullMemento) -> MementoRawData {
    JsonMementoStore::encode_all(memento, &[]).expect("mementos encode")
}

fn encode_with_catalog(memento: &FullMemento, catalog: &[CatalogItemMemento]) -> MementoRawData {
    JsonMementoStore::encode_all(memento, catalog).expect("mementos encode")
}

fn app_with_child() -> FullMemento {
    let mut app = EntityMemento::new("app-1", "TestEntity");
    app.children.push("child-1".into());
    app.config.insert("name".into(), json!("nameval"));
    let mut child = EntityMemento::new("child-1", "TestChild");
    child.parent = Some("app-1".into());

    let mut memento = FullMemento::default();
    memento.entities.insert(app.id.clone(), app);
    memento.entities.insert(child.id.clone(), child);
    memento
}

/// App with a location, one adjunct of each kind, and a child.
fn full_application() -> FullMemento {
    let mut memento = app_with_child();
    let app = memento.entities.get_mut("app-1").expect("app present");
    app.locations.push("ssh-1".into());
    app.policies.push("scaler".into());
    app.enrichers.push("aggregator".into());
    app.feeds.push("http".into());

    let mut scaler = AdjunctMemento::new(ObjectKind::Policy, "scaler", "AutoScaler");
    scaler.config.insert("max".into(), json!(5));
    scaler.unique_tag = Some("scaler-tag".into());
    memento.policies.insert(scaler.id.clone(), scaler);
    memento.enrichers.insert(
        "aggregator".into(),
        AdjunctMemento::new(ObjectKind::Enricher, "aggregator", "Aggregator"),
    );
    memento
        .feeds
        .insert("http".into(), AdjunctMemento::new(ObjectKind::Feed, "http", "HttpFeed"));

    let mut ssh = LocationMemento::new("ssh-1", "SshMachine");
    ssh.config.insert("address".into(), json!("10.0.0.7"));
    memento.locations.insert(ssh.id.clone(), ssh);
    memento
}

fn has_cause(err: &RebindError, predicate: impl Fn(&RebindError) -> bool) -> bool {
    err.causes().into_iter().any(predicate)
}

fn child_ids(entity: &Arc<Entity>) -> Vec<String> {
    entity.children().iter().map(|child| child.id().to_owned()).collect()
}

#[test]
fn rebind_restores_application_with_child_and_config() {
    let h = harness(RebindConfig::default(), encode(&app_with_child()));
    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");

    assert_eq!(outcome.application_ids(), vec!["app-1"]);
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(app.config("name"), Some(json!("nameval")));
    assert_eq!(child_ids(app), vec!["child-1"]);
    let child = &app.children()[0];
    assert_eq!(child.parent_id().as_deref(), Some("app-1"));
    assert!(!app.is_read_only());
    assert_eq!(outcome.counts.entities, 2);
    assert!(h.plane.application("app-1").is_some());
    assert!(h.plane.entity("child-1").is_some());
}

#[test]
fn dangling_child_is_dropped_with_a_warning() {
    let mut memento = app_with_child();
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .children
        .push("e-123".into());
    let h = harness(RebindConfig::default(), encode(&memento));
    let outcome = h.manager.rebind(NodeState::Master).expect("quorum tolerates one miss");

    assert_eq!(outcome.dangling, 1);
    assert!(outcome.warnings >= 1);
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(child_ids(app), vec!["child-1"]);
}

#[test]
fn dangling_child_fails_fast_when_configured() {
    let mut memento = app_with_child();
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .children
        .push("e-123".into());
    let mut config = RebindConfig::default();
    config.failure_modes.dangling_ref = FailureMode::FailFast;
    let h = harness(config, encode(&memento));

    let err = h.manager.rebind(NodeState::Master).expect_err("dangling ref is fatal");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::DanglingReference { id, .. } if id == "e-123"
    )));
    assert!(h.plane.application("app-1").is_none());
}

#[test]
fn too_many_dangling_references_break_the_quorum() {
    let mut app = EntityMemento::new("app-1", "TestEntity");
    app.children = (0..30).map(|i| format!("gone-{i}")).collect();
    let mut memento = FullMemento::default();
    memento.entities.insert(app.id.clone(), app);
    let h = harness(RebindConfig::default(), encode(&memento));

    let err = h.manager.rebind(NodeState::Master).expect_err("quorum broken");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::QuorumExceeded {
            total_dangling: 30,
            total_items: 31
        }
    )));
}

#[test]
fn config_failure_fails_fast_before_management() {
    let mut memento = app_with_child();
    let app = memento.entities.get_mut("app-1").expect("app present");
    app.config.insert("quota".into(), json!({"cpu": 2}));
    app.config_types.insert("quota".into(), "com.acme.Quota".into());
    let mut config = RebindConfig::default();
    config.failure_modes.add_config = FailureMode::FailFast;
    let h = harness(config, encode(&memento));

    let err = h.manager.rebind(NodeState::Master).expect_err("config failure is fatal");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::AddConfigFailure { key, .. } if key == "quota"
    )));
    assert!(h.plane.application("app-1").is_none());
    assert!(h.plane.managed_ids(ObjectKind::Entity).is_empty());
}

#[test]
fn config_failure_is_tolerated_when_continuing() {
    let mut memento = app_with_child();
    let app = memento.entities.get_mut("app-1").expect("app present");
    app.config.insert("quota".into(), json!({"cpu": 2}));
    app.config_types.insert("quota".into(), "com.acme.Quota".into());
    let mut config = RebindConfig::default();
    config.failure_modes.add_config = FailureMode::Continue;
    let h = harness(config, encode(&memento));

    let outcome = h.manager.rebind(NodeState::Master).expect("bad key skipped");
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(app.config("name"), Some(json!("nameval")));
    assert!(app.config("quota").is_none());
}

#[test]
fn catalog_persistence_disabled_skips_the_catalog() {
    let catalog = [CatalogItemMemento::new("web", "1.0", "TestEntity")];
    let mut config = RebindConfig::default();
    config.persist_catalog_items = false;
    let h = harness(config, encode_with_catalog(&app_with_child(), &catalog));

    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    assert_eq!(outcome.counts.catalog_items, 0);
    assert_eq!(h.plane.catalog_len(), 0);
    assert_eq!(outcome.application_ids(), vec!["app-1"]);
}

#[test]
fn hot_standby_objects_are_read_only_and_feeds_stay_stopped() {
    let starts = Arc::new(CountingStarts::default());
    let types = registry();
    types.register(TypeRegistration::feed("HttpFeed").hooks(starts.clone()));
    let catalog = [CatalogItemMemento::new("web", "1.0", "TestEntity")];
    let h = harness_with(
        RebindConfig::default(),
        types,
        encode_with_catalog(&full_application(), &catalog),
    );

    let outcome = h.manager.rebind(NodeState::HotStandby).expect("standby rebind");
    assert!(outcome.read_only);
    let app = outcome.application("app-1").expect("app rebuilt");
    for entity in app.descendants_and_self() {
        assert!(entity.is_read_only(), "{} should be read-only", entity.id());
    }
    for location in app.locations() {
        assert!(location.is_read_only());
    }
    for kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
        let adjuncts = app.adjuncts(kind);
        assert_eq!(adjuncts.len(), 1, "one {kind} attached");
        assert!(adjuncts[0].is_read_only());
    }
    let feed = &app.adjuncts(ObjectKind::Feed)[0];
    assert!(!feed.is_running());
    assert_eq!(starts.0.load(Ordering::SeqCst), 0);
    let item = h.plane.catalog_item("web:1.0").expect("catalog installed");
    assert!(item.is_read_only());
}

#[test]
fn master_rebind_attaches_and_starts_adjuncts() {
    let h = harness(RebindConfig::default(), encode(&full_application()));
    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let app = outcome.application("app-1").expect("app rebuilt");

    let scaler = &app.adjuncts(ObjectKind::Policy)[0];
    assert_eq!(scaler.config("max"), Some(json!(5)));
    assert_eq!(scaler.unique_tag().as_deref(), Some("scaler-tag"));
    assert_eq!(scaler.entity().map(|e| e.id().to_owned()).as_deref(), Some("app-1"));
    assert!(app.adjuncts(ObjectKind::Feed)[0].is_running());
    assert_eq!(app.location_ids(), vec!["ssh-1"]);
    assert_eq!(
        h.plane.location("ssh-1").and_then(|l| l.config("address")),
        Some(json!("10.0.0.7"))
    );
    assert_eq!(outcome.counts.total(), 6);
}

#[test]
fn disabled_adjunct_kinds_are_not_rebuilt() {
    let mut config = RebindConfig::default();
    config.persist_feeds = false;
    let h = harness(config, encode(&full_application()));
    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let app = outcome.application("app-1").expect("app rebuilt");

    assert_eq!(outcome.counts.feeds, 0);
    assert!(app.adjuncts(ObjectKind::Feed).is_empty());
    assert_eq!(app.adjuncts(ObjectKind::Policy).len(), 1);
}

#[test]
fn failing_adjunct_is_evicted_and_others_survive() {
    let types = registry();
    types.register(TypeRegistration::policy("Grumpy").hooks(Arc::new(FailingRebind)));
    let mut memento = full_application();
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .policies
        .insert(0, "grumpy".into());
    memento.policies.insert(
        "grumpy".into(),
        AdjunctMemento::new(ObjectKind::Policy, "grumpy", "Grumpy"),
    );
    let h = harness_with(RebindConfig::default(), types, encode(&memento));

    let outcome = h.manager.rebind(NodeState::Master).expect("adjunct failure tolerated");
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(app.adjunct_ids(ObjectKind::Policy), vec!["scaler"]);
    assert_eq!(outcome.counts.policies, 1);
    assert!(outcome.warnings >= 1);
}

#[test]
fn unknown_entity_type_fails_at_end() {
    let mut memento = app_with_child();
    memento.entities.insert(
        "mystery".into(),
        EntityMemento::new("mystery", "com.acme.Unregistered"),
    );
    let h = harness(RebindConfig::default(), encode(&memento));

    let err = h.manager.rebind(NodeState::Master).expect_err("creation failure reported");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::CreationFailure { id, .. } if id == "mystery"
    )));
    // FAIL_AT_END lets the remaining phases run.
    assert!(h.plane.application("app-1").is_some());
    // already reported once; managing the missing root stays quiet
    assert!(!has_cause(&err, |cause| matches!(
        cause,
        RebindError::ReconstructionFailure { id, .. } if id == "mystery"
    )));
}

#[test]
fn missing_catalog_item_is_counted_as_dangling() {
    let mut memento = app_with_child();
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .catalog_item_id = Some("gone:1.0".into());

    let h = harness(RebindConfig::default(), encode(&memento));
    let outcome = h.manager.rebind(NodeState::Master).expect("default scope loads the type");
    assert_eq!(outcome.dangling, 1);
    assert!(outcome.application("app-1").is_some());

    let mut config = RebindConfig::default();
    config.failure_modes.dangling_ref = FailureMode::FailFast;
    let h = harness(config, encode(&memento));
    let err = h.manager.rebind(NodeState::Master).expect_err("dangling catalog item is fatal");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::DanglingReference { kind: ObjectKind::CatalogItem, id } if id == "gone:1.0"
    )));
    assert!(h.plane.application("app-1").is_none());
}

#[test]
fn empty_store_rebinds_under_a_strict_quorum() {
    let mut config = RebindConfig::default();
    config.dangling_quorum = QuorumCheck::LinearRange {
        points: vec![[0.0, 1.0], [10.0, 10.0]],
    };
    let h = harness(config, MementoRawData::new());

    let outcome = h.manager.rebind(NodeState::Master).expect("nothing dangles");
    assert_eq!(outcome.counts.total(), 0);
    assert_eq!(outcome.dangling, 0);
}

#[test]
fn stale_children_list_does_not_steal_a_child() {
    let mut first = EntityMemento::new("a-1", "TestEntity");
    first.children.push("c-1".into());
    let mut second = EntityMemento::new("b-1", "TestEntity");
    second.children.push("c-1".into());
    let mut child = EntityMemento::new("c-1", "TestChild");
    child.parent = Some("b-1".into());
    let mut memento = FullMemento::default();
    for entity in [first, second, child] {
        memento.entities.insert(entity.id.clone(), entity);
    }
    let h = harness(RebindConfig::default(), encode(&memento));

    let outcome = h.manager.rebind(NodeState::Master).expect("conflict is only a warning");
    assert!(child_ids(outcome.application("a-1").expect("a-1 rebuilt")).is_empty());
    assert_eq!(child_ids(outcome.application("b-1").expect("b-1 rebuilt")), vec!["c-1"]);
    let child = h.plane.entity("c-1").expect("child managed");
    assert_eq!(child.parent_id().as_deref(), Some("b-1"));
    assert!(outcome.warnings >= 1);
}

/// Refuses one application and delegates everything else.
struct RefusingPlane {
    inner: InMemoryManagementPlane,
    refused: &'static str,
}

impl ManagementPlane for RefusingPlane {
    fn managed_ids(&self, kind: ObjectKind) -> Vec<String> {
        self.inner.managed_ids(kind)
    }

    fn last_transition_mode(&self, kind: ObjectKind, id: &str) -> Option<ManagementTransitionMode> {
        self.inner.last_transition_mode(kind, id)
    }

    fn set_transition_mode(&self, kind: ObjectKind, id: &str, mode: ManagementTransitionMode) {
        self.inner.set_transition_mode(kind, id, mode)
    }

    fn manage_rebinded_root_location(&self, location: Arc<Location>) -> anyhow::Result<()> {
        self.inner.manage_rebinded_root_location(location)
    }

    fn manage_rebinded_root_entity(&self, application: Arc<Entity>) -> anyhow::Result<()> {
        if application.id() == self.refused {
            return Err(anyhow!("{} refused by the plane", application.id()));
        }
        self.inner.manage_rebinded_root_entity(application)
    }

    fn install_catalog(&self, items: Vec<Arc<CatalogItem>>) -> anyhow::Result<()> {
        self.inner.install_catalog(items)
    }
}

#[test]
fn refused_application_does_not_block_its_siblings() {
    let mut memento = app_with_child();
    let other = EntityMemento::new("app-2", "TestEntity");
    memento.entities.insert(other.id.clone(), other);
    let plane = Arc::new(RefusingPlane {
        inner: InMemoryManagementPlane::new(),
        refused: "app-2",
    });
    let mut config = RebindConfig::default();
    config.failure_modes.rebind = FailureMode::FailAtEnd;
    let manager = RebindManager::new(
        config,
        Arc::new(registry()),
        Arc::new(InMemorySource::new(encode(&memento))),
        plane.clone(),
    );

    let err = manager.rebind(NodeState::Master).expect_err("refusal is reported at the end");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::ManageFailure { kind: ObjectKind::Entity, id, .. } if id == "app-2"
    )));
    assert!(plane.inner.application("app-1").is_some());
    assert!(plane.inner.entity("child-1").is_some());
    assert!(plane.inner.application("app-2").is_none());
}

#[test]
fn disabled_feeds_are_never_decoded() {
    let mut raw = encode(&full_application());
    raw.insert(ObjectKind::Feed, "http", "{truncated".to_owned());
    let mut config = RebindConfig::default();
    config.persist_feeds = false;
    config.failure_modes.load_policy = FailureMode::FailAtEnd;
    let h = harness(config, raw);

    let outcome = h.manager.rebind(NodeState::Master).expect("disabled feed table is ignored");
    assert_eq!(outcome.counts.feeds, 0);
    assert_eq!(outcome.counts.policies, 1);
}

#[test]
fn versioned_catalog_reference_is_upgraded() {
    let mut memento = app_with_child();
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .catalog_item_id = Some("web:0.9".into());
    let mut disabled = CatalogItemMemento::new("web", "3.0", "TestEntity");
    disabled.disabled = true;
    let catalog = [
        CatalogItemMemento::new("web", "1.0", "TestEntity"),
        CatalogItemMemento::new("web", "2.0", "TestEntity"),
        disabled,
    ];
    let h = harness(RebindConfig::default(), encode_with_catalog(&memento, &catalog));

    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(app.catalog_item_id(), Some("web:2.0"));
    assert_eq!(h.plane.catalog_len(), 3);
}

#[test]
fn child_inherits_catalog_item_of_its_ancestor() {
    let mut memento = app_with_child();
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .catalog_item_id = Some("web:1.0".into());
    let catalog = [CatalogItemMemento::new("web", "1.0", "TestEntity")];
    let h = harness(RebindConfig::default(), encode_with_catalog(&memento, &catalog));

    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(app.children()[0].catalog_item_id(), Some("web:1.0"));
}

#[test]
fn bundled_type_is_found_by_scanning_the_catalog() {
    let types = registry();
    types.register_in(TypeScope::bundle("acme"), TypeRegistration::entity("AcmeServer"));
    let mut memento = app_with_child();
    let mut server = EntityMemento::new("server-1", "AcmeServer");
    server.parent = Some("app-1".into());
    memento
        .entities
        .get_mut("app-1")
        .expect("app present")
        .children
        .push("server-1".into());
    memento.entities.insert(server.id.clone(), server);
    let catalog = [CatalogItemMemento::new("acme-server", "1.0", "AcmeServer").with_library("acme")];
    let h = harness_with(
        RebindConfig::default(),
        types,
        encode_with_catalog(&memento, &catalog),
    );

    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let server = h.plane.entity("server-1").expect("bundled entity managed");
    assert_eq!(server.catalog_item_id(), Some("acme-server:1.0"));
    assert_eq!(outcome.counts.entities, 3);
}

#[test]
fn legacy_flags_are_overwritten_by_the_memento() {
    let types = registry();
    let mut flags = IndexMap::new();
    flags.insert("mode".to_owned(), json!("legacy"));
    flags.insert("size".to_owned(), json!(1));
    types.register(TypeRegistration::entity("OldEntity").legacy(flags));
    let mut memento = app_with_child();
    let mut old = EntityMemento::new("old-1", "OldEntity");
    old.config.insert("size".into(), json!(3));
    memento.entities.insert(old.id.clone(), old);
    let h = harness_with(RebindConfig::default(), types, encode(&memento));

    h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let old = h.plane.entity("old-1").expect("legacy entity managed");
    assert_eq!(old.config("mode"), Some(json!("legacy")));
    assert_eq!(old.config("size"), Some(json!(3)));
}

#[test]
fn legacy_feeds_cannot_be_created() {
    let types = registry();
    types.register(TypeRegistration::feed("HttpFeed").legacy(IndexMap::new()));
    let h = harness_with(RebindConfig::default(), types, encode(&full_application()));

    let err = h.manager.rebind(NodeState::Master).expect_err("legacy feed refused");
    assert!(has_cause(&err, |cause| matches!(
        cause,
        RebindError::CreationFailure { kind: ObjectKind::Feed, .. }
    )));
}

#[test]
fn config_references_resolve_or_become_null() {
    let mut memento = app_with_child();
    let app = memento.entities.get_mut("app-1").expect("app present");
    app.config
        .insert("peer".into(), ObjectRef::new(ObjectKind::Entity, "child-1").to_value());
    app.config
        .insert("lost".into(), ObjectRef::new(ObjectKind::Entity, "e-404").to_value());
    let h = harness(RebindConfig::default(), encode(&memento));

    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let app = outcome.application("app-1").expect("app rebuilt");
    assert_eq!(app.config("lost"), Some(Value::Null));
    assert_eq!(
        app.config("peer"),
        Some(ObjectRef::new(ObjectKind::Entity, "child-1").to_value())
    );
    assert_eq!(outcome.dangling, 1);
}

#[test]
fn first_master_run_resets_the_catalog_once() {
    let persisted = [CatalogItemMemento::new("old", "1.0", "TestEntity")];
    let mut config = RebindConfig::default();
    config.reset_catalog_on_first_run = true;
    let h = harness(config, encode_with_catalog(&app_with_child(), &persisted));
    let manager = h.manager.with_catalog(
        CatalogInitialization::new(true)
            .with_initial_items(vec![CatalogItemMemento::new("web", "1.0", "TestEntity")]),
    );

    let first = manager.rebind(NodeState::Master).expect("first rebind");
    assert_eq!(first.catalog_items_removed, vec!["old:1.0"]);
    assert!(h.plane.catalog_item("web:1.0").is_some());
    assert!(h.plane.catalog_item("old:1.0").is_none());
    assert!(manager.catalog().has_run_final_initialization());

    let second = manager.rebind(NodeState::Master).expect("second rebind");
    assert!(second.catalog_items_removed.is_empty());
    assert!(h.plane.catalog_item("old:1.0").is_some());
    assert!(h.plane.catalog_item("web:1.0").is_none());
}

#[test]
fn standby_runs_never_reset_the_catalog() {
    let persisted = [CatalogItemMemento::new("old", "1.0", "TestEntity")];
    let mut config = RebindConfig::default();
    config.reset_catalog_on_first_run = true;
    let h = harness(config, encode_with_catalog(&app_with_child(), &persisted));

    let outcome = h.manager.rebind(NodeState::HotBackup).expect("backup rebind");
    assert!(outcome.catalog_items_removed.is_empty());
    assert!(h.plane.catalog_item("old:1.0").is_some());
    assert!(!h.manager.catalog().has_run_final_initialization());
}

#[test]
fn initial_catalog_items_fill_an_empty_catalog() {
    let h = harness(RebindConfig::default(), encode(&app_with_child()));
    let manager = h.manager.with_catalog(
        CatalogInitialization::new(false)
            .with_initial_items(vec![CatalogItemMemento::new("web", "1.0", "TestEntity")])
            .with_additional_items(vec![CatalogItemMemento::new("db", "1.0", "TestChild")]),
    );

    let outcome = manager.rebind(NodeState::Master).expect("rebind succeeds");
    assert_eq!(outcome.counts.catalog_items, 2);
    assert!(h.plane.catalog_item("web:1.0").is_some());
    assert!(h.plane.catalog_item("db:1.0").is_some());
}

#[test]
fn standby_then_master_records_transition_modes() {
    let h = harness(RebindConfig::default(), encode(&full_application()));

    h.manager.rebind(NodeState::HotStandby).expect("standby rebind");
    let standby = h
        .plane
        .last_transition_mode(ObjectKind::Entity, "app-1")
        .expect("mode recorded");
    assert_eq!(standby.before, ManagementMode::UnmanagedPersisted);
    assert_eq!(standby.after, ManagementMode::LoadedReadOnly);

    let outcome = h.manager.rebind(NodeState::Master).expect("master rebind");
    let promoted = h
        .plane
        .last_transition_mode(ObjectKind::Entity, "app-1")
        .expect("mode recorded");
    assert!(promoted.was_read_only());
    assert_eq!(promoted.after, ManagementMode::ManagedPrimary);
    let location = h
        .plane
        .last_transition_mode(ObjectKind::Location, "ssh-1")
        .expect("location mode recorded");
    assert_eq!(location.after, ManagementMode::ManagedPrimary);

    let app = outcome.application("app-1").expect("app rebuilt");
    assert!(!app.is_read_only());
    assert!(app.adjuncts(ObjectKind::Feed)[0].is_running());
}

#[test]
fn removed_objects_are_reported_stale_not_destroyed() {
    let h = harness(RebindConfig::default(), encode(&app_with_child()));
    h.manager.rebind(NodeState::Master).expect("first rebind");

    let mut trimmed = app_with_child();
    trimmed.entities.shift_remove("child-1");
    trimmed
        .entities
        .get_mut("app-1")
        .expect("app present")
        .children
        .clear();
    h.source.replace(encode(&trimmed));

    let outcome = h.manager.rebind(NodeState::Master).expect("second rebind");
    assert_eq!(outcome.stale_entities, vec!["child-1"]);
    assert!(h.plane.entity("child-1").is_some());
}

#[test]
fn rebinding_twice_yields_equal_but_distinct_graphs() {
    let raw = encode(&full_application());
    let first = harness(RebindConfig::default(), raw.clone());
    let second = harness(RebindConfig::default(), raw);

    let a = first.manager.rebind(NodeState::Master).expect("first rebind");
    let b = second.manager.rebind(NodeState::Master).expect("second rebind");
    let app_a = a.application("app-1").expect("app rebuilt");
    let app_b = b.application("app-1").expect("app rebuilt");
    assert!(!Arc::ptr_eq(app_a, app_b));

    let captured_a = capture_graph(&a.applications, &[]);
    let captured_b = capture_graph(&b.applications, &[]);
    assert_eq!(captured_a.entities, captured_b.entities);
    assert_eq!(captured_a.locations, captured_b.locations);
    assert_eq!(captured_a.policies, captured_b.policies);
    assert_eq!(captured_a.feeds, captured_b.feeds);
}

#[test]
fn captured_graph_rebinds_to_the_same_graph() {
    let h = harness(RebindConfig::default(), encode(&full_application()));
    let outcome = h.manager.rebind(NodeState::Master).expect("rebind succeeds");
    let captured = capture_graph(&outcome.applications, &[]);

    let again = harness(RebindConfig::default(), encode(&captured));
    let rebuilt = again.manager.rebind(NodeState::Master).expect("rebind of capture");
    let recaptured = capture_graph(&rebuilt.applications, &[]);
    assert_eq!(captured.entities, recaptured.entities);
    assert_eq!(captured.locations, recaptured.locations);
    assert_eq!(captured.enrichers, recaptured.enrichers);
    assert_eq!(recaptured.application_ids, vec!["app-1"]);
}

#[test]
fn read_only_runs_are_counted_and_metered() {
    let h = harness(RebindConfig::default(), encode(&app_with_child()));
    let metrics = RebindMetrics::new(Arc::new(Registry::new())).expect("metrics register");
    let manager = h.manager.with_metrics(metrics);

    for _ in 0..3 {
        manager.rebind(NodeState::HotStandby).expect("standby rebind");
    }
    manager.rebind(NodeState::Master).expect("master rebind");
    assert_eq!(manager.read_only_iterations(), 3);
    let metrics = manager.metrics().expect("metrics attached");
    assert_eq!(metrics.success_count("HOT_STANDBY"), 3);
    assert_eq!(metrics.success_count("MASTER"), 1);

    h.source.replace(
        MementoRawData::new().with(ObjectKind::Entity, "broken", "{not json"),
    );
    manager.rebind(NodeState::Master).expect_err("malformed payload");
    assert_eq!(metrics.failure_count("MASTER"), 1);
    assert_eq!(metrics.recent_errors().len(), 1);
}

#[test]
fn interrupted_manager_refuses_until_cleared() {
    let h = harness(RebindConfig::default(), encode(&app_with_child()));
    let interrupt = h.manager.interrupt();
    interrupt.interrupt();
    let err = h.manager.rebind(NodeState::Master).expect_err("interrupted");
    assert!(has_cause(&err, |cause| matches!(cause, RebindError::Interrupted)));

    interrupt.clear();
    h.manager.rebind(NodeState::Master).expect("rebind after clear");
}

#[test]
fn non_rebindable_states_are_refused() {
    let h = harness(RebindConfig::default(), encode(&app_with_child()));
    for state in [NodeState::Standby, NodeState::Initializing, NodeState::Failed] {
        assert!(matches!(
            h.manager.rebind(state),
            Err(RebindError::InvalidNodeState(s)) if s == state
        ));
    }
    assert_eq!(h.manager.permit().available(), 1);
}

#[test]
fn snapshot_file_source_feeds_a_rebind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("snapshot.json");
    save_snapshot(&encode(&app_with_child()), &path).expect("snapshot written");

    let plane = Arc::new(InMemoryManagementPlane::new());
    let manager = RebindManager::new(
        RebindConfig::default(),
        Arc::new(registry()),
        Arc::new(SnapshotFileSource::new(&path)),
        plane.clone(),
    );
    let outcome = manager.rebind_configured().expect("rebind from snapshot");
    assert_eq!(outcome.node_state, NodeState::Master);
    assert!(plane.application("app-1").is_some());
}

/// Entity `i` has parent `parents[i]`, which is always an earlier index.
fn tree_memento(parents: &[Option<usize>]) -> FullMemento {
    let mut memento = FullMemento::default();
    for (i, parent) in parents.iter().enumerate() {
        let type_name = if parent.is_none() { "TestEntity" } else { "TestChild" };
        let mut entity = EntityMemento::new(format!("e-{i}"), type_name);
        entity.parent = parent.map(|p| format!("e-{p}"));
        entity.children = parents
            .iter()
            .enumerate()
            .filter(|(_, candidate)| **candidate == Some(i))
            .map(|(child, _)| format!("e-{child}"))
            .collect();
        memento.entities.insert(entity.id.clone(), entity);
    }
    memento
}

fn parent_vectors() -> impl Strategy<Value = Vec<Option<usize>>> {
    (1usize..12).prop_flat_map(|len| {
        (0..len)
            .map(|i| {
                if i == 0 {
                    Just(None).boxed()
                } else {
                    prop_oneof![1 => Just(None), 3 => (0..i).prop_map(Some)].boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_entity_tree_rebinds_with_its_links(parents in parent_vectors()) {
        let memento = tree_memento(&parents);
        let h = harness(RebindConfig::default(), encode(&memento));
        let outcome = h.manager.rebind(NodeState::Master).expect("tree rebinds");

        let roots = parents.iter().filter(|p| p.is_none()).count();
        prop_assert_eq!(outcome.applications.len(), roots);
        prop_assert_eq!(outcome.counts.entities, parents.len());
        for (i, parent) in parents.iter().enumerate() {
            let entity = h.plane.entity(&format!("e-{i}")).expect("entity managed");
            prop_assert_eq!(entity.parent_id(), parent.map(|p| format!("e-{p}")));
            prop_assert_eq!(&entity.child_ids(), &memento.entities[&format!("e-{i}")].children);
        }
    }
}
