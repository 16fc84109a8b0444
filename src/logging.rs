//! Logging module
//!
//! Initializes the env_logger based logging system.
//! Verbosity comes from the configuration file; the format carries a
//! millisecond timestamp so per-request lines can be correlated with
//! backend logs.

use anyhow::Result;
use log::LevelFilter;

/// Parse log level string to LevelFilter
fn parse_log_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info, // Default to info for unknown values
    }
}

/// Initialize logging system
///
/// Log level is determined by config (default: info).
/// Users can change log_level in config.yaml to debug, info, warn, or error.
pub fn init_logging(log_level_str: &str) -> Result<()> {
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            // Custom log format: [timestamp] [level] message
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .filter_level(parse_log_level(log_level_str))
        .try_init()
        .ok();

    Ok(())
}
