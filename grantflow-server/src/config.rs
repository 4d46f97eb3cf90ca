use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Source base URL must use http or https")]
    InvalidSourceUrl,

    #[error("Page timeout must be at least 1 second")]
    InvalidPageTimeout,

    #[error("Retry attempts must be at least 1")]
    InvalidRetryAttempts,

    #[error("Database URL configured but the postgres feature is not enabled")]
    DatabaseFeatureMissing,
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct Config {
    pub source_base_url: Url,
    pub database_url: Option<String>,
    pub page_timeout: Duration,
    pub retry_attempts: u32,
}

impl Config {
    /// Create a new config with validation
    pub fn try_new(
        source_base_url: Url,
        database_url: Option<String>,
        page_timeout_secs: u64,
        retry_attempts: u32,
    ) -> Result<Self, ConfigError> {
        if !matches!(source_base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidSourceUrl);
        }
        if page_timeout_secs == 0 {
            return Err(ConfigError::InvalidPageTimeout);
        }
        if retry_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts);
        }
        if database_url.is_some() && !cfg!(feature = "postgres") {
            return Err(ConfigError::DatabaseFeatureMissing);
        }

        // endpoint paths are joined onto the base, which requires the
        // trailing slash
        let mut source_base_url = source_base_url;
        if !source_base_url.path().ends_with('/') {
            source_base_url.set_path(&format!("{}/", source_base_url.path()));
        }

        Ok(Self {
            source_base_url,
            database_url,
            page_timeout: Duration::from_secs(page_timeout_secs),
            retry_attempts,
        })
    }
}
