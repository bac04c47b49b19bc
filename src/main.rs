//! Metagraph CLI - inspect the transaction log and rebuild state from it.
//!
//! Usage:
//!   metagraph --config metagraph.json log-size
//!   metagraph --config metagraph.json log-show 42
//!   metagraph --config metagraph.json recover

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use metagraph::config::Config;
use metagraph::store::MemoryGraphStore;
use metagraph::transactions::{restore, LocalTransactionLog, TextCodec, TransactionCodec};
use metagraph::views::ViewProjection;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "metagraph")]
#[command(about = "Metagraph - transaction log and view maintenance")]
struct Args {
    /// Configuration file (JSON); defaults apply when absent
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of committed records
    LogSize,
    /// Print one record in the text format
    LogShow {
        /// Sequence number of the record
        index: u64,
    },
    /// Replay the log into a fresh store and rebuild every view
    Recover,
}

fn open_log(config: &Config) -> metagraph::Result<LocalTransactionLog> {
    LocalTransactionLog::with_layout(&config.log_dir, config.codec.codec(), config.shard_layout())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match args.command {
        Command::LogSize => {
            let log = open_log(&config)?;
            println!("{}", log.size());
        }
        Command::LogShow { index } => {
            let log = open_log(&config)?;
            let record = log.read_record(index)?;
            let mut stdout = std::io::stdout().lock();
            TextCodec.write(&record, &mut stdout)?;
            stdout.flush()?;
        }
        Command::Recover => {
            let start = Instant::now();
            let log = open_log(&config)?;
            let store = Arc::new(MemoryGraphStore::new());
            let restored = restore(&log, store.as_ref())?;
            println!("Restored {} records ({} statements)", restored, store.len());

            let views = config.load_views()?;
            if views.views.is_empty() {
                println!("No views configured");
            } else {
                let projection =
                    ViewProjection::open(&config.view_database, views, config.max_join_items, &config.resource_root)?;
                let rows = projection.recreate_all(store.as_ref())?;
                println!("Rebuilt {} views with {} rows", projection.config().views.len(), rows);
            }
            println!("Done in {:.3} s", start.elapsed().as_secs_f64());
        }
    }
    Ok(())
}
