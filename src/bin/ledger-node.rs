#![forbid(unsafe_code)]
//! Ledger node daemon and admin commands

use clap::{Parser, Subcommand};
use ledgernode::config::load_config;
use ledgernode::ledger::Ledger;
use ledgernode::node::Node;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Permissioned ledger node")]
struct Cli {
    /// Path to the node configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and serve the HTTP API
    Run,
    /// Truncate the chain to a block index and rebuild derived state
    Revert {
        #[arg(long)]
        block_index: u64,
    },
    /// Create any missing ledger table
    InitDb,
    /// Drop every ledger table and start from an empty ledger
    ClearDb,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run => {
            let node = Arc::new(Node::init(config)?);
            node.start().await?;
        }
        Commands::Revert { block_index } => {
            let node = Node::init(config)?;
            let report = node.revert_chain(block_index)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::InitDb => {
            let ledger = Ledger::open(&config.storage.database_path)?;
            ledger.init()?;
            info!(path = %config.storage.database_path, "ledger initialized");
        }
        Commands::ClearDb => {
            let ledger = Ledger::open(&config.storage.database_path)?;
            ledger.clear()?;
            info!(path = %config.storage.database_path, "ledger cleared");
        }
    }

    Ok(())
}
