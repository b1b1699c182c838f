//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod simulate;
mod tuning;

pub use simulate::SimulateArgs;

use anyhow::Result;
use clap::Subcommand;

use crate::config::TuningArgs;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Register retrievals on simulated queues and report what arrives
    Simulate(SimulateArgs),
    /// Print the effective tuning parameters as JSON
    Tuning(TuningArgs),
}

/// Handle a CLI command
///
/// # Arguments
/// * `command` - The command to execute
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Simulate(args) => simulate::run(args).await,
        Commands::Tuning(args) => tuning::show(&args),
    }
}
