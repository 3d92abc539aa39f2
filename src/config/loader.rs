//! Configuration loading
//!
//! Loads JSON configuration files and applies `PIVOT_*` environment overrides.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        interface = %config.stack.interface_name,
        max_inflight = config.stack.max_inflight,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `PIVOT_INTERFACE`: Override the TUN interface name
/// - `PIVOT_MAX_INFLIGHT`: Override the TCP inflight cap
/// - `PIVOT_MTU`: Override the interface MTU
/// - `PIVOT_LOG_LEVEL`: Override log level
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Apply `PIVOT_*` environment overrides to an already loaded config
///
/// The result is not re-validated; callers do that once all overrides are in.
///
/// # Errors
///
/// Returns `ConfigError::EnvError` if a variable holds an unparsable value.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(name) = std::env::var("PIVOT_INTERFACE") {
        config.stack.interface_name = name;
        debug!("Interface name overridden to {}", config.stack.interface_name);
    }

    if let Some(max) = parse_env::<usize>("PIVOT_MAX_INFLIGHT")? {
        config.stack.max_inflight = max;
        debug!("Max inflight overridden to {}", max);
    }

    if let Some(mtu) = parse_env::<usize>("PIVOT_MTU")? {
        config.stack.mtu = mtu;
        debug!("MTU overridden to {}", mtu);
    }

    if let Ok(level) = std::env::var("PIVOT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    Ok(())
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map(Some).map_err(|_| ConfigError::EnvError {
            name: name.into(),
            reason: format!("Invalid number: {value}"),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = create_temp_config(
            r#"{ "stack": { "interface_name": "pivot3", "max_inflight": 5 } }"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.stack.interface_name, "pivot3");
        assert_eq!(config.stack.max_inflight, 5);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/config.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_config_str() {
        let json = r#"{
            "stack": { "interface_name": "ligolo", "echo_rate_limit": 20 },
            "relay": { "connect_timeout_secs": 2 },
            "log": { "level": "debug", "format": "json" }
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.stack.echo_rate_limit, Some(20));
        assert_eq!(config.relay.connect_timeout_secs, 2);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_load_config_invalid_json() {
        let result = load_config_str("not valid json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let result = load_config_str(r#"{ "stack": { "max_inflight": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_parse_env_missing_is_none() {
        let value = parse_env::<usize>("PIVOT_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert!(value.is_none());
    }
}
