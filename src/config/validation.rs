use super::models::{CacheBackendKind, Config};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Timeout must be positive: {field}")]
    ZeroTimeout { field: String },

    #[error("Retry interval ({interval_ms}ms) must be shorter than retry timeout ({timeout_ms}ms)")]
    RetryIntervalExceedsTimeout { interval_ms: u64, timeout_ms: u64 },

    #[error("Fjall cache backend requires a non-empty path")]
    MissingCachePath,

    #[error("App version stamped into cache entries must not be empty")]
    EmptyAppVersion,

    #[error("Mock responses are enabled but none are configured")]
    EmptyMockResponses,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_transport(config)?;
    validate_cache(config)?;
    validate_retry(config)?;
    validate_mock(config)?;
    Ok(())
}

fn validate_transport(config: &Config) -> Result<(), ValidationError> {
    if let Some(ref base_url) = config.transport.base_url {
        let parsed = Url::parse(base_url).map_err(|e| ValidationError::InvalidBaseUrl {
            url: base_url.clone(),
            reason: e.to_string(),
        })?;

        if parsed.cannot_be_a_base() {
            return Err(ValidationError::InvalidBaseUrl {
                url: base_url.clone(),
                reason: "URL cannot be used as a base".to_string(),
            });
        }
    }

    if config.transport.timeout_ms == 0 {
        return Err(ValidationError::ZeroTimeout {
            field: "transport.timeout_ms".to_string(),
        });
    }

    if config.transport.connect_timeout_ms == 0 {
        return Err(ValidationError::ZeroTimeout {
            field: "transport.connect_timeout_ms".to_string(),
        });
    }

    Ok(())
}

fn validate_cache(config: &Config) -> Result<(), ValidationError> {
    if config.cache.backend == CacheBackendKind::Fjall && config.cache.path.as_os_str().is_empty() {
        return Err(ValidationError::MissingCachePath);
    }

    if config.cache.app_version.is_empty() {
        return Err(ValidationError::EmptyAppVersion);
    }

    Ok(())
}

fn validate_retry(config: &Config) -> Result<(), ValidationError> {
    if let Some(timeout_ms) = config.retry.timeout_ms {
        if config.retry.interval_ms >= timeout_ms {
            return Err(ValidationError::RetryIntervalExceedsTimeout {
                interval_ms: config.retry.interval_ms,
                timeout_ms,
            });
        }
    }

    Ok(())
}

fn validate_mock(config: &Config) -> Result<(), ValidationError> {
    if config.mock.enabled && config.mock.responses.is_empty() {
        return Err(ValidationError::EmptyMockResponses);
    }

    Ok(())
}
