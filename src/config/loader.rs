//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::SettlementConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<SettlementConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
///
/// `SETTLEMENT_INDEXER_URL` and `SETTLEMENT_ADMIN_API_KEY` override the file
/// when set, so deployments can keep endpoints and tokens out of it.
pub fn parse_config(content: &str) -> Result<SettlementConfig, ConfigError> {
    let mut config: SettlementConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut SettlementConfig) {
    if let Ok(url) = std::env::var("SETTLEMENT_INDEXER_URL") {
        tracing::debug!("Indexer URL overridden from environment");
        config.indexer.url = url;
    }
    if let Ok(key) = std::env::var("SETTLEMENT_ADMIN_API_KEY") {
        config.admin.api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reports_every_problem() {
        let err = parse_config(
            r#"
            [notifications]
            max_attempts = 0

            [signing]
            fee_rate = 0
            "#,
        )
        .unwrap_err();
        match err {
            ConfigError::Validation(errors) => assert!(errors.len() >= 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let result = load_config(Path::new("/nonexistent/settlement.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
