//! Error handling module
//!
//! Based on anyhow but adds a configuration error type that preserves the
//! failure phase. The reload endpoint maps read/parse failures and
//! validation failures to different HTTP status codes, so the distinction
//! must survive up to the handler.

use std::io;

/// Configuration loading errors, split by phase.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read at all.
    Read(io::Error),
    /// The file was read but is not a well-formed config document.
    Parse(serde_yaml::Error),
    /// The document parsed but violates a semantic constraint.
    Invalid(String),
}

impl ConfigError {
    /// True when the failure is a semantic validation error rather than
    /// an I/O or syntax problem. Reload answers 400 for these and 500
    /// for everything else.
    pub fn is_validation(&self) -> bool {
        matches!(self, ConfigError::Invalid(_))
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(e) => write!(f, "cannot read configuration file: {}", e),
            ConfigError::Parse(e) => write!(f, "configuration file parsing failed: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}
