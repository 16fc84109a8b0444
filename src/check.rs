//! Static configuration check
//!
//! Backing logic for `qbal check`: parse the config, run validation,
//! and surface warnings that are legal but usually unintended.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub config_path: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub algorithm: String,
    pub backend_count: usize,
}

impl CheckReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn to_plain_text(&self) -> String {
        let mut lines = vec![
            "qbal check".to_string(),
            format!(
                "  result: {}",
                if self.has_errors() { "FAILED" } else { "OK" }
            ),
            format!("  config: {}", self.config_path),
            format!("  algorithm: {}", self.algorithm),
            format!("  backends: {}", self.backend_count),
        ];

        if self.errors.is_empty() {
            lines.push("  errors: none".to_string());
        } else {
            lines.push(format!("  errors: {}", self.errors.len()));
            for error in &self.errors {
                lines.push(format!("    - {}", error));
            }
        }

        if self.warnings.is_empty() {
            lines.push("  warnings: none".to_string());
        } else {
            lines.push(format!("  warnings: {}", self.warnings.len()));
            for warning in &self.warnings {
                lines.push(format!("    - {}", warning));
            }
        }

        lines.join("\n")
    }
}

pub async fn run_check(config_path: Option<PathBuf>) -> Result<CheckReport> {
    let path = if let Some(path) = config_path {
        path
    } else {
        Config::resolve_config_path(None)?
    };

    if !path.exists() {
        bail!("Configuration file not found: {}", path.display());
    }

    // Parse and validate as separate steps so a semantic problem still
    // yields a report instead of a bare failure.
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Cannot read configuration file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&content)
        .with_context(|| format!("Configuration file parsing failed: {}", path.display()))?;

    let mut errors = Vec::new();
    if let Err(e) = config.validate() {
        errors.push(e.to_string());
    }

    let mut warnings = Vec::new();
    if config.backends.len() == 1 {
        warnings.push("only one backend configured (no failover)".to_string());
    }
    if config.q_learning.epsilon > 0.5 {
        warnings.push(format!(
            "q_learning.epsilon is {} (more than half of traffic explores)",
            config.q_learning.epsilon
        ));
    }
    if config.health_check_interval < std::time::Duration::from_secs(1) {
        warnings.push("health_check_interval under 1s probes aggressively".to_string());
    }

    Ok(CheckReport {
        config_path: path.display().to_string(),
        errors,
        warnings,
        algorithm: config.algorithm.clone(),
        backend_count: config.backends.len(),
    })
}

pub async fn run_and_print(config_path: Option<PathBuf>, strict: bool, json: bool) -> Result<()> {
    let report = run_check(config_path).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_plain_text());
    }

    if report.has_errors() || (strict && report.has_warnings()) {
        bail!("static check failed")
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> CheckReport {
        CheckReport {
            config_path: "/tmp/qbal.yaml".to_string(),
            errors: Vec::new(),
            warnings: vec!["only one backend configured (no failover)".to_string()],
            algorithm: "q-learning".to_string(),
            backend_count: 1,
        }
    }

    #[test]
    fn plain_text_lists_warnings() {
        let rendered = sample_report().to_plain_text();
        assert!(rendered.contains("qbal check"));
        assert!(rendered.contains("result: OK"));
        assert!(rendered.contains("warnings: 1"));
        assert!(rendered.contains("only one backend"));
    }

    #[tokio::test]
    async fn check_flags_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: 0\nbackends:\n  - url: http://127.0.0.1:9001\n").unwrap();

        let report = run_check(Some(path)).await.unwrap();
        assert!(report.has_errors());
        assert!(report.errors[0].contains("port"));
    }

    #[tokio::test]
    async fn check_passes_a_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "port: 8080\nbackends:\n  - url: http://127.0.0.1:9001\n  - url: http://127.0.0.1:9002\n",
        )
        .unwrap();

        let report = run_check(Some(path)).await.unwrap();
        assert!(!report.has_errors());
        assert_eq!(report.backend_count, 2);
        assert_eq!(report.algorithm, "round-robin");
    }

    #[tokio::test]
    async fn missing_file_bails() {
        assert!(run_check(Some(PathBuf::from("/nonexistent/qbal.yaml")))
            .await
            .is_err());
    }
}
