//! ---
//! keel_section: "03-persistence-logging"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Persistence abstractions and storage bindings."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{MementoRawData, PersistenceError, Result};

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    data: MementoRawData,
}

fn is_cbor(path: &Path) -> bool {
    matches!(path.extension().and_then(|ext| ext.to_str()), Some("cbor"))
}

/// Persist raw memento data to the provided filesystem path.
///
/// The serializer is selected based on file extension: `.cbor` writes CBOR,
/// all other extensions default to JSON.
pub fn save_snapshot(data: &MementoRawData, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        created_at: Utc::now(),
        hash: compute_hash(data)?,
        data: data.clone(),
    };

    let mut writer = BufWriter::new(File::create(path)?);
    if is_cbor(path) {
        let bytes = serde_cbor::to_vec(&envelope)?;
        writer.write_all(&bytes)?;
    } else {
        let json = serde_json::to_vec_pretty(&envelope)?;
        writer.write_all(&json)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), objects = data.len(), "snapshot written");
    Ok(())
}

/// Load a snapshot from disk, checking version and hash.
pub fn load_snapshot(path: &Path) -> Result<MementoRawData> {
    let envelope = load_envelope(path)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found: envelope.version,
            expected: SNAPSHOT_VERSION,
        });
    }
    if envelope.hash != compute_hash(&envelope.data)? {
        return Err(PersistenceError::HashMismatch);
    }
    debug!(path = %path.display(), objects = envelope.data.len(), created_at = %envelope.created_at, "snapshot loaded");
    Ok(envelope.data)
}

/// Verify the integrity of a snapshot without handing out its payload.
pub fn verify_snapshot(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.data)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn load_envelope(path: &Path) -> Result<SnapshotEnvelope> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope = if is_cbor(path) {
        serde_cbor::from_slice(&bytes)?
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok(envelope)
}

fn compute_hash(data: &MementoRawData) -> Result<String> {
    let serialized = serde_json::to_vec(data)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
