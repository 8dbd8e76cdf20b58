use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tileable_demos::{run_greeting, run_order_pipeline, showcase};
use tileable_engine::RuntimeConfig;

#[derive(Parser)]
#[command(name = "tileable-demo", about = "Run the tileable demonstrations")]
struct Cli {
    /// Path to a runtime config TOML file (defaults to TILEABLE_* variables)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Greet someone through the greeting plugin
    Greet {
        name: String,
        #[arg(long, default_value = "Hi")]
        prefix: String,
    },
    /// Greet and print the debug events and state the run produced
    Showcase { name: String },
    /// Route orders through the fetch/score/notify pipeline
    Orders {
        #[arg(default_values_t = vec![1, 2, 3])]
        ids: Vec<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tileable=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let config = RuntimeConfig::load(path)
                .with_context(|| format!("Could not load runtime config from {}", path.display()))?;
            config.log_summary();
            config
        }
        None => RuntimeConfig::from_env()?,
    };

    match cli.command {
        Command::Greet { name, prefix } => {
            let result = run_greeting(&prefix, &name).await?;
            println!("{}", result.message);
        }
        Command::Showcase { name } => {
            let observed = showcase(&name).await?;
            println!("{}", serde_json::to_string_pretty(&observed)?);
        }
        Command::Orders { ids } => {
            let summaries = run_order_pipeline(&ids, &config).await?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }

    Ok(())
}
