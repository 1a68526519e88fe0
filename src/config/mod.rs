//! Configuration management for courier
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//!
//! # Usage
//!
//! ```no_run
//! use courier::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Base URL: {:?}", config.transport.base_url);
//! ```
//!
//! # Environment Variables
//!
//! Any setting can be overridden with `COURIER__<section>__<key>`:
//! - `COURIER__TRANSPORT__BASE_URL=https://api.example.com`
//! - `COURIER__CACHE__BACKEND=memory`
//! - `COURIER__RETRY__COUNT=3`
//!
//! The bearer token is only read from `COURIER_AUTH_TOKEN`.
//!
//! # Configuration File
//!
//! By default the file is `config/courier.toml`; `COURIER_CONFIG` overrides it.

mod models;
mod sources;
mod validation;

pub use models::{
    CacheBackendKind, CacheSettings, Config, MockSettings, RetrySettings, TransportSettings,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[transport]
base_url = "https://api.example.com"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(
            config.transport.base_url.as_deref(),
            Some("https://api.example.com")
        );
    }

    #[test]
    fn test_validation_catches_bad_base_url() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[transport]
base_url = "::nonsense::"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_from_toml_str() {
        let config = Config::from_toml_str(
            r#"
[cache]
backend = "memory"

[retry]
count = -1
interval_ms = 100
timeout_ms = 2000
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.backend, CacheBackendKind::Memory);
        assert_eq!(config.retry.count, -1);
        assert_eq!(config.retry.timeout_ms, Some(2000));
    }

    #[test]
    fn test_from_toml_str_rejects_invalid() {
        let result = Config::from_toml_str(
            r#"
[mock]
enabled = true
            "#,
        );
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::EmptyMockResponses)
        ));
    }
}
