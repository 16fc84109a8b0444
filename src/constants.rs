//! Constants definition module
//!
//! Centralizes constants used throughout the application.
//! This improves maintainability by requiring changes in only one place.

use std::path::PathBuf;

/// Application basic settings
pub const APP_NAME: &str = "qbal";
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Session affinity cookie. Its value is the chosen backend's URL string.
pub const SESSION_COOKIE: &str = "lb_session";

/// Q-learning state file and persistence cadence
pub const DEFAULT_Q_STATE_PATH: &str = "qtable.json";
pub const Q_PERSIST_INTERVAL_SECS: u64 = 300;

/// Lower bound for the exploration rate. Decay never crosses it.
pub const EPSILON_FLOOR: f64 = 0.001;

/// Health probe settings
///
/// A backend is probed with a plain TCP connect; 2 seconds is long enough
/// for a loaded backend to accept and short enough to flag a dead one
/// within one sweep.
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 2;

/// Graceful shutdown settings
///
/// Maximum time to wait for in-flight requests after the listener stops
/// accepting. Forces shutdown after this to prevent infinite waits.
pub const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Ingress HTTP server limits
///
/// Read applies to header parsing, write to each write toward the
/// client, idle to a connection with no traffic in either direction.
pub const HEADER_READ_TIMEOUT_SECS: u64 = 15;
pub const INGRESS_WRITE_TIMEOUT_SECS: u64 = 15;
pub const INGRESS_IDLE_TIMEOUT_SECS: u64 = 60;

/// Upstream transport pool limits
pub const UPSTREAM_IDLE_PER_HOST: usize = 10;
pub const UPSTREAM_IDLE_TIMEOUT_SECS: u64 = 90;
pub const UPSTREAM_KEEPALIVE_SECS: u64 = 60;

/// Configuration file priority (higher = more priority)
/// 1. Path specified via CLI argument
/// 2. $HOME/.qbal/config.yaml
/// 3. /etc/qbal/config.yaml
pub fn get_home_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".qbal").join(CONFIG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

pub fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/qbal").join(CONFIG_FILENAME)
}
