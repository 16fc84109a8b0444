//! CLI argument parsing module
//!
//! Uses clap derive macros to declaratively define commands and arguments.
//! This approach ensures type safety and automatically generates --help and --version.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// qbal - Adaptive L7 HTTP load balancer
///
/// An HTTP reverse proxy that routes each request with one of six
/// policies, including a reinforcement-learning policy that keeps
/// adjusting per-backend value estimates from live traffic.
#[derive(Parser, Debug)]
#[command(
    name = "qbal",
    about = "Adaptive L7 HTTP load balancer",
    long_about = r#"
qbal is an adaptive L7 HTTP load balancer.

Key Features:
  - Six routing policies: round-robin, weighted-round-robin,
    least-connections, least-response-time, ip-hash, q-learning
  - Q-learning policy learns backend quality from live traffic and
    persists its table across restarts
  - Circuit breaker per backend, fused with periodic TCP health probes
  - Sticky sessions via the lb_session cookie
  - Token-bucket ingress rate limiting
  - Hot policy reload over GET /reload, Q-table preserved

Usage Examples:
  qbal start                       # Start with the default config path
  qbal start -c ./config.yaml      # Start with a specific config file
  qbal check -c ./config.yaml      # Validate a config without starting
  qbal check --json                # Machine-readable validation report
"#,
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Subcommand (start, check)
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the load balancer
    ///
    /// Starts the proxy with the specified configuration file.
    /// If no config file is specified, searches default paths.
    #[command(name = "start", about = "Start the load balancer")]
    Start {
        /// Configuration file path (optional)
        ///
        /// If not specified, searches in this order:
        /// 1. $HOME/.qbal/config.yaml
        /// 2. /etc/qbal/config.yaml
        #[arg(short, long, value_name = "FILE", help = "Configuration file path")]
        config: Option<PathBuf>,
    },

    /// Validate static configuration
    ///
    /// Parses and validates the configuration without starting the
    /// proxy or touching any backend.
    #[command(name = "check", about = "Validate static configuration")]
    Check {
        /// Configuration file path to validate
        #[arg(
            short,
            long,
            value_name = "FILE",
            help = "Configuration file path to validate"
        )]
        config: Option<PathBuf>,

        /// Treat warnings as errors (non-zero exit)
        #[arg(long, help = "Return non-zero when warnings are present")]
        strict: bool,

        /// Print check report in JSON format
        #[arg(long, help = "Print check report in JSON format")]
        json: bool,
    },
}

impl Cli {
    /// Parse CLI arguments and create Cli struct
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
