//! Ledger migrator - moves member balances from a legacy ledger to its replacement
//!
//! # WARNING
//! - `run` signs and sends real transfers from the operating wallet.
//! - Always start with `--dry-run` and a small `--divisor` on a new deployment.
//! - Funds relayed across the bridge cannot be pulled back by this tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

// Use the library crate
use ledger_migrator::cli::commands::{self, RunArgs};
use ledger_migrator::config::Config;

/// Ledger migrator - resumable balance migration across a bridge
#[derive(Parser)]
#[command(name = "migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "migrate.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration
    Run {
        /// Resolve amounts and log intended transfers, send nothing
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Concurrent transfer attempts per round
        #[arg(long)]
        parallelism: Option<usize>,

        /// Dust threshold in base units
        #[arg(long, value_name = "AMOUNT")]
        dust: Option<String>,

        /// Scale all earnings down by this factor (test runs)
        #[arg(long)]
        divisor: Option<u64>,

        /// Do not check or bridge funds before transferring
        #[arg(long)]
        skip_funding: bool,

        /// Do not add missing members on the new ledger
        #[arg(long)]
        skip_membership_sync: bool,

        /// Only migrate these addresses (repeatable)
        #[arg(long, value_name = "ADDR")]
        only: Vec<String>,
    },

    /// Show the transfer audit trail
    Records {
        /// Number of most recent records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only show records for this account
        #[arg(long, value_name = "ADDR")]
        account: Option<String>,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Check gateway, contracts and operator balances
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ledger_migrator=info".parse().unwrap()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run {
            dry_run,
            yes,
            parallelism,
            dust,
            divisor,
            skip_funding,
            skip_membership_sync,
            only,
        } => {
            let args = RunArgs {
                dry_run,
                yes,
                parallelism,
                dust,
                divisor,
                skip_funding,
                skip_membership_sync,
                only,
            };
            commands::run(&config, args).await
        }
        Commands::Records { limit, account } => commands::records(&config, limit, account)
            .await
            .map(|_| 0),
        Commands::Config => commands::show_config(&config).map(|_| 0),
        Commands::Health => commands::health(&config).await.map(|_| 0),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => {
            info!("Migration incomplete, exiting with status {}", code);
            std::process::exit(code);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
