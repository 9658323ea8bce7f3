//! Configuration loader for JSON engine settings.

use std::path::Path;

use crate::config::schema::EngineConfig;
use crate::error::{ConfigError, IgnoreError};

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<EngineConfig, IgnoreError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()).into());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("Failed to read config file: {}", e)))?;

    parse_config(&content)
}

/// Parse configuration from a JSON string.
pub fn parse_config(json: &str) -> Result<EngineConfig, IgnoreError> {
    let config: EngineConfig = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse config JSON: {}", e)))?;

    config.validate()?;

    Ok(config)
}

/// Parse and validate configuration from a string.
/// Returns None if the string is empty, invalid JSON, or fails validation.
pub fn load_config_from_string(content: &str) -> Option<EngineConfig> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }

    match parse_config(trimmed) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::debug!("Failed to parse config from string: {}", e);
            None
        }
    }
}
