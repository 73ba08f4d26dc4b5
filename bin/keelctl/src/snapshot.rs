//! ---
//! keel_section: "04-tooling"
//! keel_subsection: "binary"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Snapshot verification and table listing."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use keel_persistence::{load_snapshot, verify_snapshot, MementoRawData, ObjectKind};

/// Top-level snapshot commands.
#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    /// Check the envelope hash of a snapshot file.
    Verify(SnapshotArgs),
    /// List the object tables held by a snapshot file.
    Inspect(SnapshotArgs),
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    /// Snapshot file (`.json` or `.cbor`).
    #[arg(value_name = "FILE")]
    pub path: PathBuf,
}

pub fn run(command: SnapshotCommand) -> Result<()> {
    match command {
        SnapshotCommand::Verify(args) => {
            if !verify_snapshot(&args.path) {
                bail!("snapshot {} failed verification", args.path.display());
            }
            println!("{}: ok", args.path.display());
        }
        SnapshotCommand::Inspect(args) => {
            let data = load_snapshot(&args.path)
                .with_context(|| format!("unable to load snapshot {}", args.path.display()))?;
            print!("{}", render_tables(&data));
        }
    }
    Ok(())
}

fn render_tables(data: &MementoRawData) -> String {
    let mut out = String::new();
    for kind in ObjectKind::ALL {
        let table = data.table(kind);
        out.push_str(&format!("{:<12} {}\n", kind.as_str(), table.len()));
        for id in table.keys() {
            out.push_str(&format!("  {id}\n"));
        }
    }
    out
}
