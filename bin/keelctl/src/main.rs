//! ---
//! keel_section: "04-tooling"
//! keel_subsection: "binary"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Control CLI for operators inspecting keel snapshots."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Parser, Subcommand};
use keel_logging as logging;

mod dry_run;
mod snapshot;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "keel administrative control utility",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "Snapshot integrity and content actions")]
    Snapshot(snapshot::SnapshotCommand),
    #[command(about = "Rebind a snapshot into a scratch management plane and report the result")]
    Rebind(dry_run::RebindOptions),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Snapshot(cmd) => {
            logging::init();
            snapshot::run(cmd)?
        }
        Commands::Rebind(opts) => dry_run::run(opts)?,
    }
    Ok(())
}
