//! ---
//! keel_section: "04-tooling"
//! keel_subsection: "binary"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Dry-run rebind of a snapshot into a scratch management plane."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use indexmap::IndexMap;
use keel_common::{init_tracing, AppConfig, FailureMode, FailureModes, NodeState};
use keel_persistence::{load_snapshot, MementoRawData, ObjectKind};
use keel_rebind::{
    AdjunctMemento, CatalogItemMemento, InMemoryManagementPlane, ObjectManifest, RebindError,
    RebindManager, RebindOutcome, SnapshotFileSource, TypeRegistration, TypeRegistry,
};
use tracing::{debug, warn};

/// Options for `keelctl rebind`.
#[derive(Debug, Args)]
pub struct RebindOptions {
    /// Snapshot file to rebind.
    #[arg(value_name = "FILE")]
    pub snapshot: PathBuf,
    /// Node state to rebind as (master, hot-standby, hot-backup).
    #[arg(long, value_name = "STATE")]
    pub state: Option<NodeState>,
    /// Configuration file supplying failure modes and catalog flags.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Apply one failure mode to every failure category.
    #[arg(long = "failure-mode", value_name = "MODE")]
    pub failure_mode: Option<FailureMode>,
}

pub fn run(options: RebindOptions) -> Result<()> {
    let mut config = match &options.config {
        Some(path) => {
            let config = AppConfig::from_path(path)?;
            init_tracing("keelctl", &config.logging)?;
            config
        }
        None => {
            keel_logging::init();
            AppConfig::default()
        }
    };
    if let Some(state) = options.state {
        config.rebind.node_state = state;
    }
    if let Some(mode) = options.failure_mode {
        config.rebind.failure_modes = FailureModes::uniform(mode);
    }

    match dry_run(&options.snapshot, &config) {
        Ok(outcome) => {
            print!("{}", render_outcome(&outcome));
            Ok(())
        }
        Err(err) => {
            if let Some(rebind) = err.downcast_ref::<RebindError>() {
                for cause in rebind.causes() {
                    eprintln!("  - {cause}");
                }
            }
            Err(err)
        }
    }
}

/// Rebind `path` against a scratch plane, registering a plain type for
/// every type name the snapshot mentions.
pub fn dry_run(path: &Path, config: &AppConfig) -> Result<RebindOutcome> {
    let data = load_snapshot(path)
        .with_context(|| format!("unable to load snapshot {}", path.display()))?;
    let types = registry_for(&data);
    let manager = RebindManager::new(
        config.rebind.clone(),
        Arc::new(types),
        Arc::new(SnapshotFileSource::new(path)),
        Arc::new(InMemoryManagementPlane::new()),
    );
    let outcome = manager
        .rebind_configured()
        .with_context(|| format!("rebind of {} failed", path.display()))?;
    Ok(outcome)
}

fn registry_for(data: &MementoRawData) -> TypeRegistry {
    // (kind, type) -> registered as an application
    let mut seen: IndexMap<(ObjectKind, String), bool> = IndexMap::new();
    for kind in [ObjectKind::Entity, ObjectKind::Location] {
        for (id, payload) in data.table(kind) {
            match serde_json::from_str::<ObjectManifest>(payload) {
                Ok(manifest) => {
                    let top_level = kind == ObjectKind::Entity && manifest.parent.is_none();
                    *seen.entry((kind, manifest.type_name)).or_default() |= top_level;
                }
                Err(err) => warn!(kind = kind.as_str(), %id, error = %err, "unreadable manifest; type not registered"),
            }
        }
    }
    for kind in [ObjectKind::Policy, ObjectKind::Enricher, ObjectKind::Feed] {
        for (id, payload) in data.table(kind) {
            match serde_json::from_str::<AdjunctMemento>(payload) {
                Ok(memento) => {
                    seen.entry((kind, memento.type_name)).or_default();
                }
                Err(err) => warn!(kind = kind.as_str(), %id, error = %err, "unreadable adjunct; type not registered"),
            }
        }
    }
    for payload in data.table(ObjectKind::CatalogItem).values() {
        if let Ok(item) = serde_json::from_str::<CatalogItemMemento>(payload) {
            if !item.plan_type.is_empty() {
                seen.entry((ObjectKind::Entity, item.plan_type)).or_default();
            }
        }
    }

    let types = TypeRegistry::new();
    for ((kind, type_name), application) in seen {
        debug!(kind = kind.as_str(), %type_name, application, "registering dry-run type");
        let mut registration = TypeRegistration::new(kind, type_name);
        if application {
            registration = registration.application();
        }
        types.register(registration);
    }
    types
}

fn render_outcome(outcome: &RebindOutcome) -> String {
    let mut out = format!(
        "state: {}\nread-only: {}\nobjects: {}\n",
        outcome.node_state, outcome.read_only, outcome.counts
    );
    out.push_str(&format!("applications: {}\n", outcome.application_ids().join(", ")));
    if !outcome.stale_entities.is_empty() {
        out.push_str(&format!("stale entities: {}\n", outcome.stale_entities.join(", ")));
    }
    out.push_str(&format!(
        "dangling references: {}\nwarnings: {}\n",
        outcome.dangling, outcome.warnings
    ));
    out
}
