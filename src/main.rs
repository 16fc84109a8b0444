//! qbal - Adaptive L7 HTTP Load Balancer
//!
//! qbal is an HTTP reverse proxy with these features:
//! - Six routing policies behind one interface, including Q-learning
//!   routing that learns per-backend value estimates from live traffic
//! - Circuit breaker per backend fused with periodic TCP health probes
//! - Sticky sessions (lb_session cookie) and token-bucket rate limiting
//! - Hot policy reload over GET /reload with Q-table preservation
//! - Graceful shutdown (in-flight requests drained on SIGINT/SIGTERM)

use anyhow::Result;

mod algorithms;
mod backend_pool;
mod check;
mod circuit_breaker;
mod cli;
mod config;
mod constants;
mod error;
mod health;
mod logging;
mod metrics;
mod policy;
mod q_learning;
mod rate_limiter;
mod reload;
mod server;
mod state;
mod supervisor;
mod tls;

use cli::{Cli, Commands};
use config::Config;

/// Run async logic with the pre-parsed command
async fn run_with_command(command: Commands) -> Result<()> {
    match command {
        Commands::Start { config } => {
            let config_path = Config::resolve_config_path(config.as_deref())?;
            // Startup config problems are fatal, unlike reload-time ones.
            let config = Config::load_from_file(&config_path).await?;

            logging::init_logging(&config.log_level)?;
            log::info!("qbal v{} starting", env!("CARGO_PKG_VERSION"));

            supervisor::run(config, config_path).await
        }
        Commands::Check {
            config,
            strict,
            json,
        } => {
            logging::init_logging("info")?;
            check::run_and_print(config, strict, json).await
        }
    }
}

/// Application entry point
/// Parses CLI arguments and dispatches to the appropriate subcommand.
fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_with_command(cli.command))
}
