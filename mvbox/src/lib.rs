//! mvbox - moves chat messages out of the inbox
//!
//! Watches a source folder (usually `INBOX`) and a target folder (usually
//! `DeltaChat`) over IMAP. Messages that belong to a chat thread, judged by
//! walking their reply chain, are moved to the target folder. Ordinary mail
//! stays where it is.
//!
//! ## Module Organization
//!
//! - `engine/`: applying classifications, cascades, move batches
//! - `worker/`: per-folder control loop and the state both workers share
//! - `store/`: message metadata and watermarks, persisted in SQLite
//! - `transport/`: mail server access, IMAP
//! - `config/`: configuration file
//! - `daemon`: process wiring, restarts, status

pub mod backoff;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod store;
pub mod transport;
pub mod worker;

use clap::Parser;
use tracing::info;

use cli::{Cli, Commands};
use error::Result;

/// Entry point behind the binary: parse arguments, load configuration, dispatch
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    match &cli.command {
        Commands::Run { .. } => {
            info!("Starting mvbox ...");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(daemon::run(config))
        }
        Commands::Status { json } => {
            let stats = daemon::status(&config)?;
            daemon::print_status(&stats, *json)
        }
    }
}
