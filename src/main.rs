// RagDB CLI - retrieval-augmented generation engine
use anyhow::Result;
use clap::{Parser, Subcommand};

use ragdb::{init_logging_with_level, Engine, Settings};

#[derive(Parser)]
#[command(name = "ragdb", version, about = "Multi-tenant RAG engine")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server
    Serve {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: String,
    },
    /// Run a background worker
    Worker {
        /// Queues to consume, comma-separated
        #[arg(long, default_value = "default,docling")]
        queues: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging_with_level(cli.verbose, cli.quiet)?;

    let settings = Settings::from_env()?;
    let engine = Engine::build(settings).await?;

    match cli.command {
        Command::Serve { addr } => {
            ragdb::start_server(engine.state.clone(), &addr).await?;
        }
        Command::Worker { queues } => {
            let queues: Vec<String> = queues
                .split(',')
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
            engine.worker().with_queues(queues).run().await?;
        }
    }

    Ok(())
}
