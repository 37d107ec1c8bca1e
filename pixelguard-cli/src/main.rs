//! ## pixelguard-cli
//! **Operator interface to the pattern pipeline**
//! Runs the orchestrator as a long-lived service and exposes the ledger,
//! validator and index for inspection and manual intervention.
//!
//! ### Expectations:
//! - Every command reads the same layered configuration as the service
//! - Records are printed as JSON so they can be piped into other tools
//! - Manual rollbacks are audited like automatic ones

use clap::Parser;

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run_command(cli).await
}
