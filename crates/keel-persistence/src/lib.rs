//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Persistence abstractions and storage bindings."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Raw persisted state consumed by the rebind engine.
//!
//! The engine never looks inside the bytes kept here; decoding them into
//! mementos is the job of a memento store adapter.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing snapshot files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CBOR serialization issues.
    #[error("cbor serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    /// Reported when a snapshot fails integrity verification.
    #[error("snapshot hash mismatch")]
    HashMismatch,
    /// Reported when a snapshot was written by an incompatible envelope version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u16,
        /// Version this build writes.
        expected: u16,
    },
}

pub mod kind;
pub mod raw;
pub mod snapshot;

pub use kind::ObjectKind;
pub use raw::MementoRawData;
pub use snapshot::{load_snapshot, save_snapshot, verify_snapshot, SNAPSHOT_VERSION};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_error_is_readable() {
        let err = PersistenceError::UnsupportedVersion {
            found: 9,
            expected: SNAPSHOT_VERSION,
        };
        assert_eq!(format!("{err}"), "unsupported snapshot version 9 (expected 1)");
    }
}
