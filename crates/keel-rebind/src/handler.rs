//! ---
//! keel_section: "02-rebind-engine"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Per-run classification of rebind failures."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
//! Exception handler.
//!
//! Every recoverable failure of a run is classified here and answered with the
//! configured [`FailureMode`]. The handler is single use: [`ExceptionHandler`]
//! is consumed by [`ExceptionHandler::start`], and the resulting
//! [`ActiveExceptionHandler`] is consumed by exactly one of
//! [`ActiveExceptionHandler::on_done`] or [`ActiveExceptionHandler::on_failed`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use keel_common::{FailureMode, FailureModes, QuorumCheck, RebindConfig};
use keel_persistence::ObjectKind;
use tracing::{debug, warn};

use crate::error::{RebindError, Result};

/// Shared interruption flag for in-flight runs.
///
/// Once set, the next failure the handler would tolerate aborts the run instead.
#[derive(Debug, Clone, Default)]
pub struct RebindInterrupt(Arc<AtomicBool>);

impl RebindInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handler configuration, before the run starts.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    modes: FailureModes,
    quorum: QuorumCheck,
    interrupt: RebindInterrupt,
}

impl ExceptionHandler {
    pub fn new(modes: FailureModes, quorum: QuorumCheck) -> Self {
        Self {
            modes,
            quorum,
            interrupt: RebindInterrupt::new(),
        }
    }

    pub fn from_config(config: &RebindConfig) -> Self {
        Self::new(config.failure_modes, config.dangling_quorum.clone())
    }

    pub fn with_interrupt(mut self, interrupt: RebindInterrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn modes(&self) -> &FailureModes {
        &self.modes
    }

    pub fn start(self) -> ActiveExceptionHandler {
        ActiveExceptionHandler {
            modes: self.modes,
            quorum: self.quorum,
            interrupt: self.interrupt,
            missing: IndexMap::new(),
            creation_failed_ids: HashSet::new(),
            exceptions: Vec::new(),
            add_config_failures: Vec::new(),
            add_policy_failures: Vec::new(),
            load_policy_failures: Vec::new(),
            warnings: IndexSet::new(),
            warning_count: 0,
        }
    }
}

/// Summary of a run the handler let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerReport {
    pub warnings: usize,
    pub dangling: usize,
    pub total_found: usize,
}

/// Handler of a run in progress.
#[derive(Debug)]
pub struct ActiveExceptionHandler {
    modes: FailureModes,
    quorum: QuorumCheck,
    interrupt: RebindInterrupt,
    missing: IndexMap<ObjectKind, IndexSet<String>>,
    creation_failed_ids: HashSet<String>,
    exceptions: Vec<RebindError>,
    add_config_failures: Vec<RebindError>,
    add_policy_failures: Vec<RebindError>,
    load_policy_failures: Vec<RebindError>,
    warnings: IndexSet<String>,
    warning_count: usize,
}

#[derive(Clone, Copy)]
enum Bucket {
    Exceptions,
    AddConfig,
    AddPolicy,
    LoadPolicy,
}

impl ActiveExceptionHandler {
    pub fn modes(&self) -> &FailureModes {
        &self.modes
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    /// Log once at WARN per distinct message; repeats drop to DEBUG.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.warning_count += 1;
        if self.warnings.insert(message.clone()) {
            warn!(target: "keel_rebind", "{}", message);
        } else {
            debug!(target: "keel_rebind", repeated = true, "{}", message);
        }
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// Ids of one kind that were referenced but never resolved.
    pub fn missing(&self, kind: ObjectKind) -> Vec<String> {
        self.missing
            .get(&kind)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dangling_count(&self) -> usize {
        self.missing.values().map(IndexSet::len).sum()
    }

    pub fn creation_failed(&self, id: &str) -> bool {
        self.creation_failed_ids.contains(id)
    }

    pub fn on_dangling_reference(&mut self, kind: ObjectKind, id: &str) -> Result<()> {
        self.missing.entry(kind).or_default().insert(id.to_owned());
        if self.modes.dangling_ref == FailureMode::FailFast {
            return Err(RebindError::DanglingReference {
                kind,
                id: id.to_owned(),
            });
        }
        self.check_interrupted()?;
        self.warn(format!(
            "No {} found with id {}; dangling reference on rebind",
            kind, id
        ));
        Ok(())
    }

    pub fn on_load_memento_failed(&mut self, kind: ObjectKind, id: &str, cause: anyhow::Error) -> Result<()> {
        let err = RebindError::LoadMementoFailure {
            kind,
            id: id.to_owned(),
            cause,
        };
        if kind.is_adjunct() {
            self.apply(self.modes.load_policy, err, Bucket::LoadPolicy)
        } else {
            self.on_error(err)
        }
    }

    pub fn on_create_failed(
        &mut self,
        kind: ObjectKind,
        id: &str,
        impl_type: &str,
        cause: anyhow::Error,
    ) -> Result<()> {
        self.creation_failed_ids.insert(id.to_owned());
        self.on_error(RebindError::CreationFailure {
            kind,
            id: id.to_owned(),
            impl_type: impl_type.to_owned(),
            cause,
        })
    }

    /// An object named in a memento is missing from the context. Ids whose
    /// creation already failed were reported then and are ignored.
    pub fn on_not_found(&mut self, kind: ObjectKind, id: &str) -> Result<()> {
        if self.creation_failed_ids.contains(id) {
            debug!(target: "keel_rebind", kind = %kind, id = %id, "skipping object whose creation failed");
            return Ok(());
        }
        self.on_error(RebindError::ReconstructionFailure {
            kind,
            id: id.to_owned(),
            cause: anyhow::anyhow!("no {} found with id {}", kind, id),
        })
    }

    pub fn on_rebind_failed(&mut self, kind: ObjectKind, id: &str, cause: anyhow::Error) -> Result<()> {
        let err = RebindError::ReconstructionFailure {
            kind,
            id: id.to_owned(),
            cause,
        };
        if kind.is_adjunct() {
            if self.modes.add_policy == FailureMode::Continue {
                self.creation_failed_ids.insert(id.to_owned());
            }
            self.apply(self.modes.add_policy, err, Bucket::AddPolicy)
        } else {
            self.on_error(err)
        }
    }

    pub fn on_add_config_failed(
        &mut self,
        kind: ObjectKind,
        id: &str,
        key: &str,
        cause: anyhow::Error,
    ) -> Result<()> {
        let err = RebindError::AddConfigFailure {
            kind,
            id: id.to_owned(),
            key: key.to_owned(),
            cause,
        };
        self.apply(self.modes.add_config, err, Bucket::AddConfig)
    }

    /// Attaching (or starting) an adjunct on its entity failed.
    pub fn on_add_adjunct_failed(
        &mut self,
        kind: ObjectKind,
        entity_id: &str,
        adjunct_id: &str,
        cause: anyhow::Error,
    ) -> Result<()> {
        let err = RebindError::ManageFailure {
            kind,
            id: adjunct_id.to_owned(),
            cause: cause.context(format!("attaching to entity {}", entity_id)),
        };
        self.apply(self.modes.add_policy, err, Bucket::AddPolicy)
    }

    pub fn on_manage_failed(&mut self, kind: ObjectKind, id: &str, cause: anyhow::Error) -> Result<()> {
        self.on_error(RebindError::ManageFailure {
            kind,
            id: id.to_owned(),
            cause,
        })
    }

    /// Finish a run that reached its end. Fails when any recorded error is
    /// not tolerated, or when dangling references break the quorum. The
    /// quorum is only consulted once something dangles.
    pub fn on_done(self, total_found: usize) -> Result<HandlerReport> {
        let report = HandlerReport {
            warnings: self.warning_count,
            dangling: self.dangling_count(),
            total_found,
        };
        let total_items = total_found + report.dangling;
        let quorate = report.dangling == 0 || self.quorum.is_quorate(total_found, total_items);
        let mut errors = self.into_errors();
        if !quorate {
            errors.push(RebindError::QuorumExceeded {
                total_dangling: report.dangling,
                total_items,
            });
        }
        if errors.is_empty() {
            Ok(report)
        } else {
            Err(RebindError::Compound { errors })
        }
    }

    /// Finish a run that aborted with `err`, folding in anything recorded so far.
    pub fn on_failed(self, err: RebindError) -> RebindError {
        if err.is_programming_error() {
            return err;
        }
        let recorded = self.into_errors();
        if recorded.is_empty() {
            return match err {
                RebindError::Compound { .. } => err,
                other => RebindError::Compound { errors: vec![other] },
            };
        }
        let mut errors = Vec::with_capacity(recorded.len() + 1);
        errors.push(err);
        errors.extend(recorded);
        RebindError::Compound { errors }
    }

    fn into_errors(self) -> Vec<RebindError> {
        let mut errors = Vec::new();
        if self.modes.add_policy != FailureMode::Continue {
            errors.extend(self.add_policy_failures);
        }
        if self.modes.load_policy != FailureMode::Continue {
            errors.extend(self.load_policy_failures);
        }
        if self.modes.dangling_ref != FailureMode::Continue {
            for (kind, ids) in self.missing {
                errors.extend(
                    ids.into_iter()
                        .map(|id| RebindError::DanglingReference { kind, id }),
                );
            }
        }
        if self.modes.add_config != FailureMode::Continue {
            errors.extend(self.add_config_failures);
        }
        if self.modes.rebind != FailureMode::Continue {
            errors.extend(self.exceptions);
        }
        errors
    }

    /// General failures obey the rebind failure mode.
    fn on_error(&mut self, err: RebindError) -> Result<()> {
        self.apply(self.modes.rebind, err, Bucket::Exceptions)
    }

    fn apply(&mut self, mode: FailureMode, err: RebindError, bucket: Bucket) -> Result<()> {
        match mode {
            FailureMode::FailFast => Err(err),
            FailureMode::FailAtEnd => {
                self.bucket(bucket).push(err);
                self.check_interrupted()
            }
            FailureMode::Continue => {
                self.check_interrupted()?;
                self.warn(format!("Rebind: continuing after {}", err));
                self.bucket(bucket).push(err);
                Ok(())
            }
        }
    }

    fn bucket(&mut self, bucket: Bucket) -> &mut Vec<RebindError> {
        match bucket {
            Bucket::Exceptions => &mut self.exceptions,
            Bucket::AddConfig => &mut self.add_config_failures,
            Bucket::AddPolicy => &mut self.add_policy_failures,
            Bucket::LoadPolicy => &mut self.load_policy_failures,
        }
    }

    fn check_interrupted(&self) -> Result<()> {
        if self.interrupt.is_interrupted() {
            Err(RebindError::Interrupted)
        } else {
            Ok(())
        }
    }
}
