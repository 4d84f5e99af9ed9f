// Grid Trading Engine - CLI
// Single entry point for paper runs and operator actions

use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use grid_trading_engine::{ConfigError, EngineConfig};

#[path = "../cli/engine_commands.rs"]
mod engine_commands;

#[derive(Parser)]
#[command(name = "grid-engine")]
#[command(version = "0.3.0")]
#[command(about = "Volatility-sized grid trading engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the engine against the in-process paper exchange
    Paper {
        /// JSON file holding an array of bars; a random walk is used if omitted
        #[arg(short, long)]
        bars: Option<String>,

        /// Random walk length per symbol
        #[arg(long, default_value = "600")]
        steps: usize,

        /// Random walk seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Keep nothing on disk
        #[arg(long)]
        no_db: bool,
    },

    /// Show persisted risk state and sessions
    Status {
        /// Number of recent sessions to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Clear a persisted global halt
    ResetHalt,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging first (before the command runs so config errors are visible)
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        EngineConfig::from_file(&cli.config)
            .ok()
            .and_then(|c| Level::from_str(&c.logging.level).ok())
            .unwrap_or(Level::INFO)
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("🚀 Grid Trading Engine v0.3.0");
    info!("📁 Config: {}", cli.config);

    let result = match cli.command {
        // Init doesn't require config (it creates it)
        Commands::Init { force } => engine_commands::init(&cli.config, force),
        Commands::Paper {
            bars,
            steps,
            seed,
            no_db,
        } => {
            let config = load_config_or_exit(&cli.config);
            engine_commands::paper(config, bars.as_deref(), steps, seed, no_db).await
        }
        Commands::Status { limit } => {
            let config = load_config_or_exit(&cli.config);
            engine_commands::status(&config, limit)
        }
        Commands::ResetHalt => {
            let config = load_config_or_exit(&cli.config);
            engine_commands::reset_halt(&config)
        }
    };

    if let Err(e) = result {
        error!("❌ {}", e.user_message());
        std::process::exit(1);
    }
    Ok(())
}

/// Load config or exit with helpful error message
fn load_config_or_exit(path: &str) -> EngineConfig {
    match EngineConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Configuration Error");
            error!("{}", e);
            if matches!(e, ConfigError::FileRead(_)) {
                error!("");
                error!("💡 Quick fix:");
                error!("   1. Run: grid-engine init");
                error!("   2. Edit config.toml");
                error!("   3. Try again");
            }
            std::process::exit(1);
        }
    }
}
