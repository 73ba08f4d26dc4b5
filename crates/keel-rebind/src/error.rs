//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Failure taxonomy raised by rebind runs."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use keel_common::NodeState;
use keel_persistence::{ObjectKind, PersistenceError};
use thiserror::Error;

/// Result alias used throughout the rebind engine.
pub type Result<T> = std::result::Result<T, RebindError>;

/// Every failure a rebind run can classify or raise.
#[derive(Debug, Error)]
pub enum RebindError {
    /// A memento referenced an id that never resolved.
    #[error("no {kind} found with id {id}")]
    DanglingReference { kind: ObjectKind, id: String },
    /// A memento could not be decoded.
    #[error("problem loading {kind} memento {id}: {cause:#}")]
    LoadMementoFailure {
        kind: ObjectKind,
        id: String,
        #[source]
        cause: anyhow::Error,
    },
    /// The instantiator could not allocate an object.
    #[error("problem creating {kind} {id} of type {impl_type}: {cause:#}")]
    CreationFailure {
        kind: ObjectKind,
        id: String,
        impl_type: String,
        #[source]
        cause: anyhow::Error,
    },
    /// Rebind support failed to fill an object from its memento.
    #[error("problem rebinding {kind} {id}: {cause:#}")]
    ReconstructionFailure {
        kind: ObjectKind,
        id: String,
        #[source]
        cause: anyhow::Error,
    },
    /// One config key could not be applied.
    #[error("problem adding config {key} to {kind} {id}: {cause:#}")]
    AddConfigFailure {
        kind: ObjectKind,
        id: String,
        key: String,
        #[source]
        cause: anyhow::Error,
    },
    /// The live management plane refused an object, or an adjunct could not be attached.
    #[error("problem managing {kind} {id}: {cause:#}")]
    ManageFailure {
        kind: ObjectKind,
        id: String,
        #[source]
        cause: anyhow::Error,
    },
    /// Too few objects resolved for the dangling references to be tolerable.
    #[error("too many dangling references: {total_dangling} of {total_items}")]
    QuorumExceeded {
        total_dangling: usize,
        total_items: usize,
    },
    /// A phase was entered out of order.
    #[error("rebind phase order violation: expected phase {expected}, attempted phase {actual}")]
    PhaseOrderViolation { expected: u8, actual: u8 },
    /// Every failure accumulated over a run.
    #[error("Failure rebinding: {}", summarize(.errors))]
    Compound { errors: Vec<RebindError> },
    /// The run was interrupted while tolerating a failure.
    #[error("rebind interrupted")]
    Interrupted,
    /// A rebind iteration was driven again after it had aborted.
    #[error("rebind iteration cannot be reused after it has aborted")]
    IterationReused,
    /// Rebinds only target MASTER, HOT_STANDBY, or HOT_BACKUP.
    #[error("cannot rebind in node state {0}")]
    InvalidNodeState(NodeState),
    /// The memento store adapter failed outright.
    #[error("memento store failure: {0}")]
    Store(String),
    /// Raw snapshot data could not be read.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl RebindError {
    /// Programming errors are never wrapped into a compound failure.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            RebindError::PhaseOrderViolation { .. } | RebindError::IterationReused
        )
    }

    /// Flattened list of contributing failures.
    pub fn causes(&self) -> Vec<&RebindError> {
        match self {
            RebindError::Compound { errors } => errors.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }
}

fn summarize(errors: &[RebindError]) -> String {
    match errors {
        [] => "no errors recorded".to_owned(),
        [single] => single.to_string(),
        many => format!(
            "{} errors: {}",
            many.len(),
            many.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        ),
    }
}

/// Failure raised inside a single reconstruction step.
///
/// `Object` failures belong to the object being rebuilt and are routed through
/// the exception handler; `Fatal` failures are handler decisions that abort the
/// run and propagate untouched.
#[derive(Debug, Error)]
pub enum SupportError {
    #[error(transparent)]
    Fatal(#[from] RebindError),
    #[error(transparent)]
    Object(#[from] anyhow::Error),
}
