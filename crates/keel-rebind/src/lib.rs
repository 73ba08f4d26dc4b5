//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Management-plane rebind engine rebuilding the live graph from mementos."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Rebind engine.
//!
//! Rebuilds entities, locations, policies, enrichers, feeds and catalog items
//! from persisted mementos after a restart or failover, or as a read-only copy
//! on a hot-standby node. [`RebindManager`] is the entry point; a single run is
//! a [`RebindIteration`].

pub mod capture;
pub mod catalog;
pub mod context;
pub mod error;
pub mod handler;
pub mod instantiator;
pub mod iteration;
pub mod management;
pub mod manager;
pub mod memento;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod sort;
pub mod store;
pub mod support;
pub mod values;

pub use capture::capture_graph;
pub use catalog::{CatalogInitialization, CatalogPlan};
pub use context::{RebindContext, ReferenceLookup};
pub use error::{RebindError, Result, SupportError};
pub use handler::{ActiveExceptionHandler, ExceptionHandler, HandlerReport, RebindInterrupt};
pub use instantiator::{Creation, Instantiator, ResolvedType};
pub use iteration::{ObjectCounts, RebindIteration, RebindOutcome, RebindServices};
pub use management::{
    InMemoryManagementPlane, ManagementMode, ManagementPlane, ManagementTransitionMode,
};
pub use manager::{
    InMemorySource, MementoSource, PermitGuard, RebindManager, RebindPermit, SnapshotFileSource,
};
pub use memento::{
    AdjunctMemento, CatalogItemMemento, CatalogItemType, EntityMemento, FullMemento, LocationMemento,
    Memento, MementoManifest, ObjectManifest, DEFAULT_CATALOG_VERSION,
};
pub use metrics::RebindMetrics;
pub use model::{Adjunct, CatalogItem, Entity, Location};
pub use registry::{Construction, NoopHooks, ObjectHooks, TypeRegistration, TypeRegistry, TypeScope};
pub use store::{AdjunctKinds, JsonMementoStore, MementoStore};
pub use support::{AdjunctAttachment, RebindSupport};
pub use values::{ObjectRef, ValueType};

pub use keel_common::{FailureMode, FailureModes, NodeState, QuorumCheck, RebindConfig};
pub use keel_persistence::{MementoRawData, ObjectKind};
