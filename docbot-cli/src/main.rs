//! docbot — documentation previews for pull requests.
//!
//! # Usage
//!
//! ```text
//! docbot controller start [--enable-pr-sync] [--sync-interval SECS] [--workers N]
//! docbot controller stop|status|refresh
//! docbot pr add <url> [--namespace NS] [--name NAME]
//! docbot pr list [--namespace NS] [--json]
//! docbot pr get <name> [--namespace NS]
//! docbot pr delete <name> [--namespace NS]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{controller::ControllerCommand, pr::PrCommand};

#[derive(Parser, Debug)]
#[command(
    name = "docbot",
    version,
    about = "Serve documentation previews for tracked pull requests",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or talk to the preview controller.
    Controller {
        #[command(subcommand)]
        command: ControllerCommand,
    },

    /// Manage tracked pull requests.
    Pr {
        #[command(subcommand)]
        command: PrCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Controller { command } => commands::controller::run(command),
        Commands::Pr { command } => commands::pr::run(command),
    }
}
