//! Configuration file management module
//!
//! Handles YAML configuration file parsing, validation, and default values.
//! Uses Serde to declaratively define the configuration structure with
//! strong validation. Load failures keep their phase (read / parse /
//! invalid) so the reload endpoint can answer with the right status code.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::constants::{get_home_config_path, get_system_config_path, DEFAULT_Q_STATE_PATH};
use crate::error::ConfigError;

/// Routing algorithm selector.
///
/// The config carries the algorithm as a string (so an unknown name is a
/// validation error, not a parse error); this enum is the validated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    LeastResponseTime,
    IpHash,
    QLearning,
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Algorithm::RoundRobin),
            "weighted-round-robin" => Ok(Algorithm::WeightedRoundRobin),
            "least-connections" => Ok(Algorithm::LeastConnections),
            "least-response-time" => Ok(Algorithm::LeastResponseTime),
            "ip-hash" => Ok(Algorithm::IpHash),
            "q-learning" => Ok(Algorithm::QLearning),
            other => Err(format!("unknown algorithm: {}", other)),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Algorithm::RoundRobin => "round-robin",
            Algorithm::WeightedRoundRobin => "weighted-round-robin",
            Algorithm::LeastConnections => "least-connections",
            Algorithm::LeastResponseTime => "least-response-time",
            Algorithm::IpHash => "ip-hash",
            Algorithm::QLearning => "q-learning",
        };
        write!(f, "{}", name)
    }
}

/// Individual backend server configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackendEntry {
    /// Absolute backend URL (scheme, host, port, optional path prefix)
    pub url: String,

    /// Relative traffic share for weighted algorithms.
    /// Zero or negative values are coerced to 1 at pool construction.
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

/// Q-learning hyperparameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QLearningConfig {
    /// Learning rate of the Bellman update. Never persisted; always
    /// taken from config, including across reloads.
    pub alpha: f64,
    /// Discount on future reward.
    pub gamma: f64,
    /// Initial exploration rate.
    pub epsilon: f64,
    /// Where learned state is written and read back.
    pub state_path: PathBuf,
}

impl Default for QLearningConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            gamma: 0.95,
            epsilon: 0.01,
            state_path: PathBuf::from(DEFAULT_Q_STATE_PATH),
        }
    }
}

/// Per-backend circuit breaker tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub threshold: u32,
    /// Cooldown before a trial request is allowed through again.
    #[serde(deserialize_with = "duration_str::deserialize")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Ingress token-bucket admission control
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub enabled: bool,
    /// Bucket capacity in tokens.
    pub limit: u64,
    /// Refill rate in tokens per second.
    pub burst: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 1000,
            burst: 500,
        }
    }
}

/// TLS termination at the ingress
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Complete configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port for the load balancer to listen on
    pub port: u16,

    /// Routing algorithm name (validated against the known set)
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Health probe cadence
    #[serde(
        default = "default_health_interval",
        deserialize_with = "duration_str::deserialize"
    )]
    pub health_check_interval: Duration,

    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub q_learning: QLearningConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub ssl: SslConfig,

    /// List of backend servers
    pub backends: Vec<BackendEntry>,
}

fn default_algorithm() -> String {
    "round-robin".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Resolve configuration file path
    ///
    /// Uses CLI specified path if available, otherwise searches default paths.
    pub fn resolve_config_path(cli_path: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(path) = cli_path {
            return Ok(path.to_path_buf());
        }

        let home_path = get_home_config_path();
        if home_path.exists() {
            return Ok(home_path);
        }

        let system_path = get_system_config_path();
        if system_path.exists() {
            return Ok(system_path);
        }

        // If neither exists, return home path so the error names a
        // location the operator can create.
        Ok(home_path)
    }

    /// Load configuration from file, preserving the failure phase.
    pub async fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(ConfigError::Read)?;

        let config: Config = serde_yaml::from_str(&content).map_err(ConfigError::Parse)?;

        config.validate()?;
        Ok(config)
    }

    /// The validated algorithm selector.
    ///
    /// `validate()` has already rejected unknown names, so this only
    /// fails on a config that skipped validation.
    pub fn algorithm(&self) -> Result<Algorithm, ConfigError> {
        Algorithm::from_str(&self.algorithm).map_err(ConfigError::Invalid)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port cannot be 0".to_string()));
        }

        Algorithm::from_str(&self.algorithm).map_err(ConfigError::Invalid)?;

        if self.backends.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one backend is required".to_string(),
            ));
        }

        for backend in &self.backends {
            let url = Url::parse(&backend.url).map_err(|e| {
                ConfigError::Invalid(format!("invalid backend URL {}: {}", backend.url, e))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "backend URL {} must use http or https",
                    backend.url
                )));
            }
            if url.host_str().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "backend URL {} has no host",
                    backend.url
                )));
            }
        }

        for (name, value) in [
            ("alpha", self.q_learning.alpha),
            ("gamma", self.q_learning.gamma),
            ("epsilon", self.q_learning.epsilon),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "q_learning.{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.circuit_breaker.threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit_breaker.threshold must be at least 1".to_string(),
            ));
        }

        if self.health_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "health_check_interval must be positive".to_string(),
            ));
        }

        if self.ssl.enabled && (self.ssl.cert_file.is_none() || self.ssl.key_file.is_none()) {
            return Err(ConfigError::Invalid(
                "ssl.enabled requires cert_file and key_file".to_string(),
            ));
        }

        if self.rate_limiter.enabled && (self.rate_limiter.limit == 0 || self.rate_limiter.burst == 0)
        {
            return Err(ConfigError::Invalid(
                "rate_limiter.limit and rate_limiter.burst must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Duration strings in the config ("10s", "500ms", "2m", "1h").
///
/// Kept deliberately small; bare numbers are read as seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, scale_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1.0)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000.0)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000.0)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000.0)
        } else {
            (s, 1_000.0)
        };

        let value: f64 = value
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration: {}", s))?;
        if !(value.is_finite() && value >= 0.0) {
            return Err(format!("invalid duration: {}", s));
        }
        Ok(Duration::from_millis((value * scale_ms) as u64))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
port: 8080
backends:
  - url: http://127.0.0.1:9001
  - url: http://127.0.0.1:9002
    weight: 3
"#
    }

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("config should parse")
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(minimal_yaml());
        config.validate().expect("minimal config should validate");

        assert_eq!(config.port, 8080);
        assert_eq!(config.algorithm().unwrap(), Algorithm::RoundRobin);
        assert_eq!(config.health_check_interval, Duration::from_secs(10));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.circuit_breaker.threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(10));
        assert!(!config.rate_limiter.enabled);
        assert_eq!(config.rate_limiter.limit, 1000);
        assert_eq!(config.rate_limiter.burst, 500);
        assert!(!config.ssl.enabled);
        assert_eq!(config.q_learning.alpha, 0.3);
        assert_eq!(config.q_learning.gamma, 0.95);
        assert_eq!(config.q_learning.epsilon, 0.01);
        assert_eq!(config.backends[0].weight, 1);
        assert_eq!(config.backends[1].weight, 3);
    }

    #[test]
    fn all_algorithms_parse() {
        for name in [
            "round-robin",
            "weighted-round-robin",
            "least-connections",
            "least-response-time",
            "ip-hash",
            "q-learning",
        ] {
            assert!(Algorithm::from_str(name).is_ok(), "{} should parse", name);
            assert_eq!(Algorithm::from_str(name).unwrap().to_string(), name);
        }
    }

    #[test]
    fn unknown_algorithm_is_a_validation_error() {
        let yaml = r#"
port: 8080
algorithm: fastest-first
backends:
  - url: http://127.0.0.1:9001
"#;
        let config = parse(yaml);
        let err = config.validate().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("unknown algorithm"));
    }

    #[test]
    fn empty_backends_rejected() {
        let yaml = "port: 8080\nbackends: []\n";
        let err = parse(yaml).validate().unwrap_err();
        assert!(err.to_string().contains("at least one backend"));
    }

    #[test]
    fn zero_port_rejected() {
        let yaml = "port: 0\nbackends:\n  - url: http://127.0.0.1:9001\n";
        let err = parse(yaml).validate().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn malformed_backend_url_rejected() {
        let yaml = "port: 8080\nbackends:\n  - url: \"not a url\"\n";
        let err = parse(yaml).validate().unwrap_err();
        assert!(err.to_string().contains("invalid backend URL"));

        let yaml = "port: 8080\nbackends:\n  - url: ftp://127.0.0.1:21\n";
        let err = parse(yaml).validate().unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn hyperparameters_outside_unit_interval_rejected() {
        let yaml = r#"
port: 8080
q_learning:
  alpha: 1.5
backends:
  - url: http://127.0.0.1:9001
"#;
        let err = parse(yaml).validate().unwrap_err();
        assert!(err.to_string().contains("q_learning.alpha"));
    }

    #[test]
    fn ssl_requires_cert_and_key() {
        let yaml = r#"
port: 8080
ssl:
  enabled: true
backends:
  - url: http://127.0.0.1:9001
"#;
        let err = parse(yaml).validate().unwrap_err();
        assert!(err.to_string().contains("cert_file"));
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(duration_str::parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(
            duration_str::parse("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(duration_str::parse("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(duration_str::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(duration_str::parse("15").unwrap(), Duration::from_secs(15));
        assert!(duration_str::parse("soon").is_err());
        assert!(duration_str::parse("-3s").is_err());
    }

    #[test]
    fn duration_field_rides_through_yaml() {
        let yaml = r#"
port: 8080
health_check_interval: 250ms
circuit_breaker:
  timeout: 2s
backends:
  - url: http://127.0.0.1:9001
"#;
        let config = parse(yaml);
        assert_eq!(config.health_check_interval, Duration::from_millis(250));
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(2));
    }
}
