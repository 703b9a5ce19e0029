use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::check::CheckArgs;

#[derive(Parser)]
#[command(name = "mpr")]
#[command(about = "Mempool reconciliation: bitcoind mempool vs Electrum server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the bitcoind mempool and check every transaction against Electrum.
    /// Prints one line per transaction the Electrum server does not know.
    Check(CheckArgs),

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> site -> host...)
        #[arg(long = "config", required = true)]
        paths: Vec<String>,
    },
}

fn init_tracing() {
    // stdout carries the report; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();
    init_tracing();

    match cli.cmd {
        Commands::Check(args) => commands::check::run(args).await?,

        Commands::ConfigHash { paths } => {
            let loaded = commands::load_config(&paths)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }
    }

    Ok(())
}
